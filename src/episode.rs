//! Episode records and session summaries.
//!
//! An [`EpisodeRecord`] is what the rollout driver reports once an episode is
//! over and its frames have been flushed to disk. A [`SessionSummary`] groups
//! the records of one evaluation run together with aggregate statistics.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Single episode
// ---------------------------------------------------------------------------

/// Why an episode stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The environment signalled `is_last`.
    Natural,
    /// The step budget ran out first.
    Truncated,
}

/// The outcome of one episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Zero-based episode index within the session.
    pub index: usize,
    /// Sum of the per-step rewards (absent rewards count as 0).
    pub cumulative_reward: f64,
    /// Number of agent/environment exchanges.
    pub length: usize,
    /// Frames accepted into the video buffer.
    pub frames_captured: usize,
    pub termination: Termination,
    /// Encoded video, when any frames were captured.
    pub video: Option<PathBuf>,
}

impl EpisodeRecord {
    /// Whether the environment ended the episode itself.
    pub fn is_natural_termination(&self) -> bool {
        self.termination == Termination::Natural
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Aggregate statistics over a set of episodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStats {
    pub episodes: usize,
    pub mean_reward: f64,
    pub min_reward: Option<f64>,
    pub max_reward: Option<f64>,
    pub mean_length: f64,
    pub natural_terminations: usize,
}

impl EpisodeStats {
    pub fn from_records(records: &[EpisodeRecord]) -> Self {
        if records.is_empty() {
            return Self {
                episodes: 0,
                mean_reward: 0.0,
                min_reward: None,
                max_reward: None,
                mean_length: 0.0,
                natural_terminations: 0,
            };
        }
        let n = records.len() as f64;
        let rewards = records.iter().map(|r| r.cumulative_reward);
        Self {
            episodes: records.len(),
            mean_reward: rewards.clone().sum::<f64>() / n,
            min_reward: rewards.clone().reduce(f64::min),
            max_reward: rewards.reduce(f64::max),
            mean_length: records.iter().map(|r| r.length as f64).sum::<f64>() / n,
            natural_terminations: records.iter().filter(|r| r.is_natural_termination()).count(),
        }
    }
}

/// Everything one evaluation run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique identifier (UUID v4).
    pub run_id: String,
    pub task: String,
    pub checkpoint: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub episodes: Vec<EpisodeRecord>,
    pub stats: EpisodeStats,
}

impl SessionSummary {
    /// Serialize the summary to a JSON file, creating parent directories.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create summary directory {}", parent.display())
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize session summary")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write session summary to {}", path.display()))?;
        tracing::info!(path = %path.display(), episodes = self.episodes.len(), "Saved session summary");
        Ok(())
    }

    /// Deserialize a summary from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session summary from {}", path.display()))?;
        serde_json::from_str(&data).context("Failed to deserialize session summary JSON")
    }
}
