//! Core environment trait and shared types.
//!
//! Every environment backend (the built-in mock, the HTTP bridge, ...)
//! implements the [`Environment`] trait so that the rollout driver can
//! interact with it uniformly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tensor::{Action, DType, Observation};

/// Shape and element type of a single observation or action channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub dtype: DType,
    /// Per-instance shape, without a batch axis.
    pub shape: Vec<usize>,
}

impl Space {
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
        }
    }

    /// Number of elements in one instance of this channel.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Channel name -> space.
pub type Spaces = BTreeMap<String, Space>;

/// The core environment trait.
///
/// An environment is a single mutable resource: it is reset at the start of
/// every episode and closed exactly once when the session ends.
pub trait Environment {
    /// Channels the environment emits.
    fn obs_space(&self) -> &Spaces;

    /// Channels the environment accepts.
    fn act_space(&self) -> &Spaces;

    /// Start a new episode and return its first observation.
    fn reset(&mut self) -> anyhow::Result<Observation>;

    /// Apply an unbatched action and return the resulting observation.
    fn step(&mut self, action: &Action) -> anyhow::Result<Observation>;

    /// Release the backend. Called once, after the last episode.
    fn close(&mut self) -> anyhow::Result<()>;
}
