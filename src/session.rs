//! Evaluation sessions: restore an agent, run it for N episodes, report.
//!
//! The environment is acquired once per session and wrapped in an
//! [`EnvGuard`], which closes it exactly once whether the session completes
//! or aborts part-way.

use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::agent::{Agent, Checkpoint, LinearAgent};
use crate::config::EvalConfig;
use crate::env::{make_env, Environment, Spaces};
use crate::episode::{EpisodeRecord, EpisodeStats, SessionSummary};
use crate::rollout::RolloutDriver;
use crate::tensor::LOG_PREFIX;
use crate::video::encoder_for;

/// Checkpoint entry holding the agent's parameters.
pub const AGENT_KEY: &str = "agent";

/// Action channel reserved for the environment's own reset signal.
const RESET_ACTION: &str = "reset";

/// Per-run knobs that come from the command line rather than the config.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub num_episodes: usize,
    pub output_dir: PathBuf,
    /// Capture frames and write one video per episode.
    pub render: bool,
    pub max_steps: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            num_episodes: 5,
            output_dir: PathBuf::from("videos"),
            render: true,
            max_steps: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment lifecycle
// ---------------------------------------------------------------------------

/// Owns an environment and closes it exactly once.
///
/// [`EnvGuard::close`] reports the close error; dropping the guard without
/// calling it (an early `?` return, a panic) closes the environment and only
/// logs a failure.
pub struct EnvGuard<E: Environment> {
    env: E,
    closed: bool,
}

impl<E: Environment> EnvGuard<E> {
    pub fn new(env: E) -> Self {
        Self { env, closed: false }
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.env.close().context("Failed to close environment")
    }
}

impl<E: Environment> Deref for EnvGuard<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.env
    }
}

impl<E: Environment> DerefMut for EnvGuard<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.env
    }
}

impl<E: Environment> Drop for EnvGuard<E> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.env.close() {
            tracing::warn!(error = %e, "Failed to close environment");
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Observation and action spaces the policy is built from.
pub fn policy_spaces<E: Environment>(env: &E) -> (Spaces, Spaces) {
    let obs_space = env
        .obs_space()
        .iter()
        .filter(|(k, _)| !k.starts_with(LOG_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let act_space = env
        .act_space()
        .iter()
        .filter(|(k, _)| k.as_str() != RESET_ACTION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (obs_space, act_space)
}

/// Run `options.num_episodes` episodes back to back, stopping at the first
/// failure. Progress lines go to `out`; each episode's line is written
/// before it starts.
pub fn run_episodes<A, E, W>(
    driver: &RolloutDriver<'_>,
    agent: &A,
    env: &mut E,
    options: &SessionOptions,
    out: &mut W,
) -> Result<Vec<EpisodeRecord>>
where
    A: Agent,
    E: Environment,
    W: Write,
{
    let mut records = Vec::with_capacity(options.num_episodes);
    for ep in 0..options.num_episodes {
        writeln!(out, "Episode {}/{}", ep + 1, options.num_episodes)?;
        out.flush()?;

        let record = driver
            .run_episode(agent, env, ep, options.max_steps, options.render)
            .with_context(|| format!("Episode {ep} failed"))?;

        writeln!(
            out,
            "  Score: {:.1}, Length: {}",
            record.cumulative_reward, record.length
        )?;
        tracing::info!(
            episode = ep,
            reward = record.cumulative_reward,
            length = record.length,
            natural = record.is_natural_termination(),
            frames = record.frames_captured,
            "episode finished"
        );
        records.push(record);
    }
    Ok(records)
}

/// Evaluate the checkpoint on the environment selected by `config`.
pub fn run(
    config: &EvalConfig,
    checkpoint: &Path,
    options: &SessionOptions,
) -> Result<SessionSummary> {
    let env = make_env(config)?;
    run_with_env(config, checkpoint, options, env)
}

/// Evaluate the checkpoint on an already constructed environment.
///
/// The environment is closed before this returns, on success and on error.
pub fn run_with_env<E: Environment>(
    config: &EvalConfig,
    checkpoint: &Path,
    options: &SessionOptions,
    env: E,
) -> Result<SessionSummary> {
    let started_at = Utc::now();
    let mut env = EnvGuard::new(env);

    println!("Checkpoint: {}", checkpoint.display());
    println!("Task:       {}", config.task);
    println!("Episodes:   {}", options.num_episodes);
    println!("Output:     {}", options.output_dir.display());

    let (obs_space, act_space) = policy_spaces(&*env);
    let mut agent = LinearAgent::new(&obs_space, &act_space, &config.agent, config.seed)?;
    Checkpoint::new()
        .bind(AGENT_KEY, &mut agent)
        .load(checkpoint, &[AGENT_KEY])?;

    let encoder = encoder_for(&config.video);
    let driver = RolloutDriver::new(encoder.as_ref(), &options.output_dir);
    let records = run_episodes(&driver, &agent, &mut *env, options, &mut io::stdout())?;
    env.close()?;

    let summary = SessionSummary {
        run_id: Uuid::new_v4().to_string(),
        task: config.task.clone(),
        checkpoint: checkpoint.to_path_buf(),
        started_at,
        finished_at: Utc::now(),
        stats: EpisodeStats::from_records(&records),
        episodes: records,
    };

    if config.write_summary {
        summary.save_to_file(config.resolved_logdir().join("summary.json"))?;
    }
    print_summary(&summary);
    Ok(summary)
}

/// Print the end-of-run report.
pub fn print_summary(summary: &SessionSummary) {
    let stats = &summary.stats;
    println!();
    println!("=== Evaluation Summary ===");
    println!("Task:               {}", summary.task);
    println!("Episodes:           {}", stats.episodes);
    println!("Mean score:         {:.2}", stats.mean_reward);
    if let (Some(min), Some(max)) = (stats.min_reward, stats.max_reward) {
        println!("Score range:        {min:.1} .. {max:.1}");
    }
    println!("Mean length:        {:.1}", stats.mean_length);
    println!(
        "Terminated:         {}/{}",
        stats.natural_terminations, stats.episodes
    );
    let videos = summary.episodes.iter().filter(|r| r.video.is_some()).count();
    println!("Videos written:     {videos}");
}
