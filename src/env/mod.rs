//! Environment abstractions and concrete backends.
//!
//! Every backend implements the [`Environment`] trait so that the rollout
//! driver can interact with it uniformly.
//!
//! Included backends:
//! - **Mock** ([`mock`]) -- a deterministic bouncing-ball arena rendered
//!   in-process.
//! - **Remote** ([`remote`]) -- a JSON-over-HTTP bridge to an external
//!   simulator server.

pub mod mock;
pub mod remote;
pub mod traits;

use std::time::Duration;

use anyhow::{Context, Result};

// Re-export the core trait and space types at the module level.
pub use traits::{Environment, Space, Spaces};

use crate::config::{EnvBackend, EvalConfig};
use crate::tensor::{Action, Observation};

// ---------------------------------------------------------------------------
// AnyEnv: enum dispatch wrapper for runtime backend selection
// ---------------------------------------------------------------------------

/// An enum wrapper around all concrete environment types, enabling runtime
/// backend selection from configuration.
#[derive(Debug)]
pub enum AnyEnv {
    Mock(mock::MockEnv),
    Remote(remote::RemoteEnv),
}

impl Environment for AnyEnv {
    fn obs_space(&self) -> &Spaces {
        match self {
            Self::Mock(e) => e.obs_space(),
            Self::Remote(e) => e.obs_space(),
        }
    }

    fn act_space(&self) -> &Spaces {
        match self {
            Self::Mock(e) => e.act_space(),
            Self::Remote(e) => e.act_space(),
        }
    }

    fn reset(&mut self) -> Result<Observation> {
        match self {
            Self::Mock(e) => e.reset(),
            Self::Remote(e) => e.reset(),
        }
    }

    fn step(&mut self, action: &Action) -> Result<Observation> {
        match self {
            Self::Mock(e) => e.step(action),
            Self::Remote(e) => e.step(action),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Mock(e) => e.close(),
            Self::Remote(e) => e.close(),
        }
    }
}

/// Construct the environment selected by `config.env.backend`.
pub fn make_env(config: &EvalConfig) -> Result<AnyEnv> {
    match config.env.backend {
        EnvBackend::Mock => {
            tracing::info!(task = %config.task, "Using mock environment");
            Ok(AnyEnv::Mock(
                mock::MockEnv::new(&config.env.mock).with_seed(config.seed),
            ))
        }
        EnvBackend::Remote => {
            tracing::info!(task = %config.task, url = %config.env.server_url, "Using remote environment");
            let env = remote::RemoteEnv::connect(
                &config.env.server_url,
                &config.task,
                config.seed,
                Duration::from_secs(config.env.request_timeout_secs),
            )
            .with_context(|| format!("Failed to create environment for task '{}'", config.task))?;
            Ok(AnyEnv::Remote(env))
        }
    }
}
