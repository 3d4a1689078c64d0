//! The rollout-and-capture loop.
//!
//! [`RolloutDriver::run_episode`] drives one episode by repeatedly:
//!   1. dropping `log/` channels from the current observation and adding a
//!      batch dimension of 1,
//!   2. asking the agent for an action in eval mode, threading its carry,
//!   3. dropping the batch dimension from the action and stepping the
//!      environment,
//!   4. buffering the new observation's `image` when rendering,
//!   5. accumulating reward until `is_last` or the step budget is spent.
//!
//! The buffered frames are then written as one video per episode.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::agent::{Agent, PolicyMode};
use crate::env::Environment;
use crate::episode::{EpisodeRecord, Termination};
use crate::tensor::LOG_PREFIX;
use crate::video::{episode_file_name, FrameEncoder, VideoWriter};

/// Runs single episodes and writes their videos into `output_dir`.
pub struct RolloutDriver<'a> {
    encoder: &'a dyn FrameEncoder,
    output_dir: PathBuf,
}

impl<'a> RolloutDriver<'a> {
    pub fn new(encoder: &'a dyn FrameEncoder, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            encoder,
            output_dir: output_dir.into(),
        }
    }

    /// Run one episode of at most `max_steps` exchanges.
    ///
    /// Any agent, environment or encoder failure aborts the episode and is
    /// returned as is; the caller owns the environment's lifecycle.
    pub fn run_episode<A, E>(
        &self,
        agent: &A,
        env: &mut E,
        episode_index: usize,
        max_steps: usize,
        capture_video: bool,
    ) -> Result<EpisodeRecord>
    where
        A: Agent,
        E: Environment,
    {
        let mut writer = VideoWriter::new(&self.output_dir, episode_index, self.encoder);

        let mut obs = env
            .reset()
            .with_context(|| format!("Failed to reset environment for episode {episode_index}"))?;
        // The carry lives only as long as this episode.
        let mut carry = agent.init_policy(1)?;

        let mut cumulative_reward = 0.0_f64;
        let mut length = 0_usize;
        let mut termination = Termination::Truncated;

        while length < max_steps {
            let batched = obs.without_prefix(LOG_PREFIX).batched();
            let output = agent
                .policy(carry, &batched, PolicyMode::Eval)
                .with_context(|| format!("Policy failed at step {length}"))?;
            carry = output.carry;

            let action = output
                .action
                .unbatched()
                .context("Policy returned an action without a batch dimension")?;
            obs = env
                .step(&action)
                .with_context(|| format!("Environment step {length} failed"))?;

            if capture_video {
                if let Some(image) = obs.image() {
                    writer.add_frame(image);
                }
            }

            cumulative_reward += obs.reward();
            length += 1;

            if obs.is_last() {
                termination = Termination::Natural;
                break;
            }
        }

        if termination == Termination::Truncated {
            tracing::debug!(episode = episode_index, max_steps, "episode truncated");
        }

        let frames_captured = writer.len();
        let name = episode_file_name(episode_index, cumulative_reward, writer.extension());
        let video = writer.save(Some(name.as_str()))?;

        Ok(EpisodeRecord {
            index: episode_index,
            cumulative_reward,
            length,
            frames_captured,
            termination,
            video,
        })
    }
}
