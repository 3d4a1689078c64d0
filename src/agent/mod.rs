//! Agents: the [`Agent`] trait the rollout driver talks to, the built-in
//! [`LinearAgent`], and checkpoint restoration.

pub mod checkpoint;
pub mod linear;
pub mod traits;

// Re-export the primary types for convenient access.
pub use checkpoint::{Checkpoint, Checkpointable};
pub use linear::{LinearAgent, LinearCarry, LinearParams};
pub use traits::{Agent, PolicyMode, PolicyOutput};
