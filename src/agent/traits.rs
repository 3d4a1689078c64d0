//! The interface the rollout driver needs from an agent.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tensor::{Action, Channels, Observation};

/// How the policy picks actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Train,
    /// Deterministic: the same carry and observation always give the same
    /// action.
    Eval,
    Explore,
}

/// Result of one policy call.
#[derive(Debug)]
pub struct PolicyOutput<C> {
    /// Recurrent state for the next call.
    pub carry: C,
    /// Batched action, one row per environment.
    pub action: Action,
    /// Auxiliary outputs (logits, values, ...). Not interpreted by callers.
    pub aux: Channels,
}

/// A trained, recurrent policy.
///
/// Parameters are immutable while acting: every method takes `&self`. The
/// per-episode recurrent state lives in the opaque [`Agent::Carry`], which
/// callers create with [`Agent::init_policy`] and thread by value through
/// successive [`Agent::policy`] calls without inspecting it.
pub trait Agent {
    type Carry;

    /// Fresh recurrent state for `batch_size` environments.
    fn init_policy(&self, batch_size: usize) -> Result<Self::Carry>;

    /// Choose actions for a batched observation.
    fn policy(
        &self,
        carry: Self::Carry,
        obs: &Observation,
        mode: PolicyMode,
    ) -> Result<PolicyOutput<Self::Carry>>;
}
