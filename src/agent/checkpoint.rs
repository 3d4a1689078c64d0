//! Checkpoint files: named JSON entries restored into live objects.
//!
//! A checkpoint is a JSON object whose top-level keys name the saved
//! components (`"agent"`, ...), plus a `saved_at` timestamp. Targets are
//! bound to keys on a [`Checkpoint`], then [`Checkpoint::load`] restores the
//! requested subset in place.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;

/// Something whose state can be written to and restored from a checkpoint.
pub trait Checkpointable {
    fn save_state(&self) -> Result<Value>;

    /// Replace the current state. Implementations validate the incoming state
    /// and leave `self` untouched on error.
    fn load_state(&mut self, state: Value) -> Result<()>;
}

/// Binds checkpoint keys to the objects they restore into.
#[derive(Default)]
pub struct Checkpoint<'a> {
    slots: BTreeMap<String, &'a mut dyn Checkpointable>,
}

impl<'a> Checkpoint<'a> {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    /// Bind `target` to `key`.
    pub fn bind(&mut self, key: &str, target: &'a mut dyn Checkpointable) -> &mut Self {
        self.slots.insert(key.to_string(), target);
        self
    }

    /// Restore the entries named in `keys` from the file at `path`.
    pub fn load(&mut self, path: impl AsRef<Path>, keys: &[&str]) -> Result<()> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint from {}", path.display()))?;
        let document: Value = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))?;
        let Value::Object(mut entries) = document else {
            bail!("checkpoint {} is not a JSON object", path.display());
        };

        for key in keys {
            let Some(target) = self.slots.get_mut(*key) else {
                bail!("no target bound for checkpoint key '{key}'");
            };
            let Some(state) = entries.remove(*key) else {
                bail!("checkpoint {} has no entry '{key}'", path.display());
            };
            target
                .load_state(state)
                .with_context(|| format!("Failed to restore '{key}' from {}", path.display()))?;
        }

        tracing::info!(path = %path.display(), keys = ?keys, "Loaded checkpoint");
        Ok(())
    }

    /// Write every bound target to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut entries = serde_json::Map::new();
        for (key, target) in &self.slots {
            let state = target
                .save_state()
                .with_context(|| format!("Failed to snapshot '{key}'"))?;
            entries.insert(key.clone(), state);
        }
        entries.insert("saved_at".into(), Value::String(Utc::now().to_rfc3339()));

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&Value::Object(entries))
            .context("Failed to serialize checkpoint")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write checkpoint to {}", path.display()))?;
        tracing::info!(path = %path.display(), entries = self.slots.len(), "Saved checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Counter {
        value: i64,
    }

    impl Checkpointable for Counter {
        fn save_state(&self) -> Result<Value> {
            Ok(serde_json::json!({ "value": self.value }))
        }

        fn load_state(&mut self, state: Value) -> Result<()> {
            let Some(value) = state.get("value").and_then(Value::as_i64) else {
                bail!("missing integer 'value'");
            };
            self.value = value;
            Ok(())
        }
    }

    fn scratch_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("evalreel_ckpt_{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn save_then_load_restores_bound_targets() {
        let path = scratch_path();
        let mut saved = Counter { value: 42 };
        Checkpoint::new().bind("agent", &mut saved).save(&path).unwrap();

        let mut restored = Counter::default();
        Checkpoint::new()
            .bind("agent", &mut restored)
            .load(&path, &["agent"])
            .unwrap();
        assert_eq!(restored.value, 42);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_entry_is_fatal() {
        let path = scratch_path();
        std::fs::write(&path, r#"{"optimizer": {"value": 1}}"#).unwrap();

        let mut counter = Counter::default();
        let err = Checkpoint::new()
            .bind("agent", &mut counter)
            .load(&path, &["agent"])
            .unwrap_err();
        assert!(err.to_string().contains("no entry 'agent'"));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let path = scratch_path();
        std::fs::write(&path, "not json").unwrap();
        let mut counter = Counter::default();
        assert!(Checkpoint::new()
            .bind("agent", &mut counter)
            .load(&path, &["agent"])
            .is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn invalid_state_leaves_target_untouched() {
        let path = scratch_path();
        std::fs::write(&path, r#"{"agent": {"value": "many"}}"#).unwrap();
        let mut counter = Counter { value: 3 };
        assert!(Checkpoint::new()
            .bind("agent", &mut counter)
            .load(&path, &["agent"])
            .is_err());
        assert_eq!(counter.value, 3);
        std::fs::remove_file(path).ok();
    }
}
