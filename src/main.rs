//! Evalreel: evaluate a checkpoint and write one video per episode.
//!
//! ```text
//! evalreel --checkpoint ckpt.json --task atari_pong --episodes 5
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use evalreel::config::{EnvBackend, EvalConfig, VideoFormat};
use evalreel::session::{self, SessionOptions};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Roll a trained agent through an environment and record episode videos.
#[derive(Parser)]
#[command(name = "evalreel", version, about)]
struct Cli {
    /// Checkpoint to restore the agent from.
    #[arg(long)]
    checkpoint: PathBuf,

    /// Task name; the part before the first `_` selects the config suite.
    #[arg(long, default_value = "atari_pong")]
    task: String,

    /// Number of episodes to run.
    #[arg(long, default_value_t = 5)]
    episodes: usize,

    /// Directory the videos are written to.
    #[arg(long, default_value = "./videos")]
    output: PathBuf,

    /// Upper bound on steps per episode.
    #[arg(long, default_value_t = 10_000)]
    max_steps: usize,

    /// Run without capturing frames or writing videos.
    #[arg(long)]
    no_render: bool,

    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the built-in mock environment instead of the environment server.
    #[arg(long)]
    mock: bool,

    /// Override the configured video format.
    #[arg(long)]
    format: Option<VideoFormat>,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = EvalConfig::load(cli.config.as_deref(), &cli.task)?;
    if cli.mock {
        config.env.backend = EnvBackend::Mock;
    }
    if let Some(format) = cli.format {
        config.video.format = format;
    }

    let options = SessionOptions {
        num_episodes: cli.episodes,
        output_dir: cli.output,
        render: !cli.no_render,
        max_steps: cli.max_steps,
    };

    tracing::info!(
        task = %config.task,
        backend = ?config.env.backend,
        format = ?config.video.format,
        "Starting evaluation"
    );
    session::run(&config, &cli.checkpoint, &options)?;
    Ok(())
}
