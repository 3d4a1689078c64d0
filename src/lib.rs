//! Evalreel: roll a trained agent through an environment and record videos
//!
//! A session restores an agent from a checkpoint, runs it for a fixed number
//! of episodes against one environment, buffers the rendered `image`
//! observations of each episode and encodes them into one video per episode.

pub mod agent;
pub mod config;
pub mod env;
pub mod episode;
pub mod rollout;
pub mod session;
pub mod tensor;
pub mod video;

#[cfg(test)]
mod testing;
