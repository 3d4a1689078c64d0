//! Evaluation configuration.
//!
//! A configuration file is a JSON document with a `defaults` section and
//! optional per-suite sections keyed by the first `_`-delimited segment of the
//! task name (`atari` for `atari_pong`). Resolution order, later wins:
//!
//! 1. built-in document ([`EvalConfig::default`] plus built-in suites),
//! 2. the user's file, merged key-by-key into the built-in document,
//! 3. `defaults`, then the task's suite section.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Complete configuration for one evaluation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Task identifier, e.g. `atari_pong`.
    pub task: String,
    /// Seed forwarded to the environment and the agent's sampler.
    pub seed: u64,
    /// Directory for the session summary (default `./eval_logs/<task>`).
    pub logdir: Option<PathBuf>,
    /// Write `summary.json` into `logdir` after the last episode.
    pub write_summary: bool,
    pub env: EnvConfig,
    pub video: VideoConfig,
    pub agent: AgentConfig,
}

/// Which environment implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvBackend {
    /// Built-in deterministic environment.
    Mock,
    /// HTTP environment server.
    Remote,
}

/// Environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    pub backend: EnvBackend,
    /// Base URL of the environment server (remote backend).
    pub server_url: String,
    /// Per-request timeout for the remote backend, in seconds.
    pub request_timeout_secs: u64,
    pub mock: MockEnvConfig,
}

/// Settings for the built-in mock environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockEnvConfig {
    pub height: usize,
    pub width: usize,
    /// Steps until `is_last`; `None` never terminates.
    pub episode_length: Option<usize>,
    /// A reward is emitted every `reward_every` steps (0 disables rewards).
    pub reward_every: usize,
    pub reward: f32,
    pub num_actions: usize,
}

/// Container format of the encoded episode videos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    /// H.264 in MP4 through an `ffmpeg` subprocess.
    Mp4,
    /// Animated GIF, encoded in-process.
    Gif,
}

/// Video encoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Frames per second (default: 30).
    pub fps: u32,
    /// Lossy quality on a 0-10 scale, higher is better (default: 8).
    pub quality: u8,
    pub format: VideoFormat,
    /// Codec passed to ffmpeg (default: libx264).
    pub codec: String,
    /// ffmpeg executable.
    pub ffmpeg: String,
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Observation channel the policy reads.
    pub input_key: String,
    /// Action channel the policy writes.
    pub action_key: String,
    /// Decay applied to the recurrent logit trace each step.
    pub memory_decay: f32,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            task: "atari_pong".into(),
            seed: 0,
            logdir: None,
            write_summary: true,
            env: EnvConfig {
                backend: EnvBackend::Remote,
                server_url: "http://localhost:5000".into(),
                request_timeout_secs: 60,
                mock: MockEnvConfig {
                    height: 64,
                    width: 64,
                    episode_length: Some(200),
                    reward_every: 10,
                    reward: 1.0,
                    num_actions: 3,
                },
            },
            video: VideoConfig {
                fps: 30,
                quality: 8,
                format: VideoFormat::Mp4,
                codec: "libx264".into(),
                ffmpeg: "ffmpeg".into(),
            },
            agent: AgentConfig {
                input_key: "image".into(),
                action_key: "action".into(),
                memory_decay: 0.5,
            },
        }
    }
}

impl EvalConfig {
    /// Resolve the configuration for `task`, optionally layering a JSON file.
    pub fn load(path: Option<&Path>, task: &str) -> Result<Self> {
        let suite = suite_of(task)?;

        let mut document = builtin_document()?;
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            let file: Value = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?;
            if !file.is_object() {
                bail!("config file {} must contain a JSON object", path.display());
            }
            merge(&mut document, &file);
        }

        let mut resolved = document
            .get("defaults")
            .cloned()
            .context("config document has no 'defaults' section")?;
        match document.get(suite) {
            Some(section) => merge(&mut resolved, section),
            None => tracing::debug!(suite, "no config section for suite, using defaults"),
        }

        let mut config: Self =
            serde_json::from_value(resolved).context("Invalid configuration values")?;
        config.task = task.to_string();
        config.validate()?;
        Ok(config)
    }

    /// The config family of this task.
    pub fn suite(&self) -> &str {
        self.task.split('_').next().unwrap_or(&self.task)
    }

    /// Where the session summary goes.
    pub fn resolved_logdir(&self) -> PathBuf {
        self.logdir
            .clone()
            .unwrap_or_else(|| PathBuf::from("eval_logs").join(&self.task))
    }

    fn validate(&self) -> Result<()> {
        if self.video.fps == 0 {
            bail!("video.fps must be positive");
        }
        if self.video.quality > 10 {
            bail!("video.quality must be within 0..=10, got {}", self.video.quality);
        }
        if self.env.mock.height == 0 || self.env.mock.width == 0 {
            bail!("env.mock frame size must be non-zero");
        }
        if self.env.mock.num_actions == 0 {
            bail!("env.mock.num_actions must be positive");
        }
        Ok(())
    }
}

/// First `_`-delimited segment of a task name.
pub fn suite_of(task: &str) -> Result<&str> {
    let suite = task.split('_').next().unwrap_or_default();
    if suite.trim().is_empty() {
        bail!("invalid task name '{task}': expected '<suite>_<name>'");
    }
    Ok(suite)
}

fn builtin_document() -> Result<Value> {
    let defaults = serde_json::to_value(EvalConfig::default())
        .context("Failed to serialize built-in defaults")?;
    Ok(serde_json::json!({
        "defaults": defaults,
        "mock": { "env": { "backend": "mock" } },
    }))
}

/// Recursively merge `overlay` into `base`. Objects merge key-by-key; any
/// other value replaces what was there.
fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
