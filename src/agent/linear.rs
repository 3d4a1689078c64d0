//! A recurrent linear softmax policy.
//!
//! The policy reads one observation channel, flattens it (`uint8` inputs are
//! scaled to `[0, 1]`), and scores every discrete action with
//!
//!   `logits_t = W x_t + b + decay * logits_{t-1}`
//!
//! The previous logits are the recurrent carry; they are zeroed for any batch
//! row whose `is_first` flag is set. Actions are emitted as one-hot `float32`
//! vectors.

use std::cell::RefCell;

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Axis};
use ordered_float::OrderedFloat;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::checkpoint::Checkpointable;
use super::traits::{Agent, PolicyMode, PolicyOutput};
use crate::config::AgentConfig;
use crate::env::Spaces;
use crate::tensor::{Channels, DType, Observation, Tensor, IS_FIRST};

/// Learned parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearParams {
    /// `num_actions` rows of `num_features` weights.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearParams {
    fn zeros(num_actions: usize, num_features: usize) -> Self {
        Self {
            weights: vec![vec![0.0; num_features]; num_actions],
            bias: vec![0.0; num_actions],
        }
    }
}

/// Checkpoint entry layout.
#[derive(Debug, Serialize, Deserialize)]
struct LinearState {
    input_key: String,
    action_key: String,
    params: LinearParams,
}

/// Per-episode recurrent state: the previous logits of every batch row.
#[derive(Debug, Clone)]
pub struct LinearCarry {
    trace: Array2<f32>,
}

/// Recurrent linear policy over a single observation channel.
#[derive(Debug)]
pub struct LinearAgent {
    input_key: String,
    input_dtype: DType,
    num_features: usize,
    action_key: String,
    num_actions: usize,
    memory_decay: f32,
    params: LinearParams,
    rng: RefCell<StdRng>,
}

impl LinearAgent {
    /// Build an agent with zero parameters for the given spaces.
    pub fn new(
        obs_space: &Spaces,
        act_space: &Spaces,
        config: &AgentConfig,
        seed: u64,
    ) -> Result<Self> {
        let input = obs_space.get(&config.input_key).with_context(|| {
            format!(
                "observation space has no '{}' channel (available: {:?})",
                config.input_key,
                obs_space.keys().collect::<Vec<_>>()
            )
        })?;
        let action = act_space.get(&config.action_key).with_context(|| {
            format!(
                "action space has no '{}' channel (available: {:?})",
                config.action_key,
                act_space.keys().collect::<Vec<_>>()
            )
        })?;

        let num_features = input.numel();
        let num_actions = action.numel();
        if num_features == 0 || num_actions == 0 {
            bail!("policy input and action channels must be non-empty");
        }

        tracing::debug!(
            input = %config.input_key,
            num_features,
            num_actions,
            "built linear agent"
        );

        Ok(Self {
            input_key: config.input_key.clone(),
            input_dtype: input.dtype,
            num_features,
            action_key: config.action_key.clone(),
            num_actions,
            memory_decay: config.memory_decay,
            params: LinearParams::zeros(num_actions, num_features),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn params(&self) -> &LinearParams {
        &self.params
    }

    /// Replace the parameters after checking their shape.
    pub fn set_params(&mut self, params: LinearParams) -> Result<()> {
        if params.weights.len() != self.num_actions || params.bias.len() != self.num_actions {
            bail!(
                "expected {} action rows, got {} weight rows and {} biases",
                self.num_actions,
                params.weights.len(),
                params.bias.len()
            );
        }
        if let Some((row, w)) = params
            .weights
            .iter()
            .enumerate()
            .find(|(_, w)| w.len() != self.num_features)
        {
            bail!(
                "weight row {row} has {} features, expected {}",
                w.len(),
                self.num_features
            );
        }
        let finite = params
            .weights
            .iter()
            .flatten()
            .chain(params.bias.iter())
            .all(|v| v.is_finite());
        if !finite {
            bail!("parameters contain non-finite values");
        }
        self.params = params;
        Ok(())
    }

    fn logits(&self, features: &[f32], previous: &[f32]) -> Vec<f32> {
        self.params
            .weights
            .iter()
            .zip(&self.params.bias)
            .zip(previous)
            .map(|((w, b), prev)| {
                let dot: f32 = w.iter().zip(features).map(|(w, x)| w * x).sum();
                dot + b + self.memory_decay * prev
            })
            .collect()
    }

    fn choose(&self, logits: &[f32], mode: PolicyMode) -> Result<usize> {
        match mode {
            // Reversed so that ties resolve to the lowest index.
            PolicyMode::Eval => Ok((0..logits.len())
                .rev()
                .max_by_key(|&a| OrderedFloat(logits[a]))
                .unwrap_or(0)),
            PolicyMode::Train | PolicyMode::Explore => {
                let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let weights: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
                let dist = WeightedIndex::new(&weights).context("invalid action distribution")?;
                Ok(dist.sample(&mut *self.rng.borrow_mut()))
            }
        }
    }
}

impl Agent for LinearAgent {
    type Carry = LinearCarry;

    fn init_policy(&self, batch_size: usize) -> Result<LinearCarry> {
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        Ok(LinearCarry {
            trace: Array2::zeros((batch_size, self.num_actions)),
        })
    }

    fn policy(
        &self,
        carry: LinearCarry,
        obs: &Observation,
        mode: PolicyMode,
    ) -> Result<PolicyOutput<LinearCarry>> {
        let input = obs
            .get(&self.input_key)
            .with_context(|| format!("observation is missing '{}'", self.input_key))?;
        let batch = carry.trace.nrows();
        if input.shape().first() != Some(&batch) {
            bail!(
                "observation '{}' has shape {:?}, expected a leading batch of {batch}",
                self.input_key,
                input.shape()
            );
        }
        if input.len() != batch * self.num_features {
            bail!(
                "observation '{}' has {} features per row, expected {}",
                self.input_key,
                input.len() / batch,
                self.num_features
            );
        }

        let scale = if self.input_dtype == DType::U8 { 1.0 / 255.0 } else { 1.0 };
        let features: Vec<f32> = input.to_f32_vec().into_iter().map(|v| v * scale).collect();
        let first: Vec<bool> = match obs.get(IS_FIRST) {
            Some(flags) => flags.to_f32_vec().into_iter().map(|v| v != 0.0).collect(),
            None => vec![false; batch],
        };

        let mut trace = carry.trace;
        let mut onehot = Array2::<f32>::zeros((batch, self.num_actions));
        for (row, mut prev) in trace.axis_iter_mut(Axis(0)).enumerate() {
            if first.get(row).copied().unwrap_or(false) {
                prev.fill(0.0);
            }
            let x = &features[row * self.num_features..(row + 1) * self.num_features];
            let previous: Vec<f32> = prev.iter().copied().collect();
            let logits = self.logits(x, &previous);
            let choice = self.choose(&logits, mode)?;
            onehot[[row, choice]] = 1.0;
            for (slot, value) in prev.iter_mut().zip(logits) {
                *slot = value;
            }
        }

        let action = Channels::new().with(self.action_key.clone(), Tensor::F32(onehot.into_dyn()));
        let aux = Channels::new().with("logits", Tensor::F32(trace.clone().into_dyn()));
        Ok(PolicyOutput {
            carry: LinearCarry { trace },
            action,
            aux,
        })
    }
}

impl Checkpointable for LinearAgent {
    fn save_state(&self) -> Result<Value> {
        let state = LinearState {
            input_key: self.input_key.clone(),
            action_key: self.action_key.clone(),
            params: self.params.clone(),
        };
        serde_json::to_value(state).context("Failed to serialize linear agent")
    }

    fn load_state(&mut self, state: Value) -> Result<()> {
        let state: LinearState =
            serde_json::from_value(state).context("malformed linear agent state")?;
        if state.input_key != self.input_key || state.action_key != self.action_key {
            bail!(
                "checkpoint maps '{}' -> '{}', agent is configured for '{}' -> '{}'",
                state.input_key,
                state.action_key,
                self.input_key,
                self.action_key
            );
        }
        self.set_params(state.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Space;
    use crate::tensor::IMAGE;
    use ndarray::{ArrayD, IxDyn};

    fn agent(num_features: usize, num_actions: usize) -> LinearAgent {
        let mut obs_space = Spaces::new();
        obs_space.insert(IMAGE.into(), Space::new(DType::U8, &[num_features]));
        let mut act_space = Spaces::new();
        act_space.insert("action".into(), Space::new(DType::F32, &[num_actions]));
        let config = AgentConfig {
            input_key: IMAGE.into(),
            action_key: "action".into(),
            memory_decay: 0.5,
        };
        LinearAgent::new(&obs_space, &act_space, &config, 0).unwrap()
    }

    fn batched_obs(pixels: &[u8], is_first: bool) -> Observation {
        Channels::new()
            .with(IMAGE, Tensor::U8(ArrayD::from_shape_vec(IxDyn(&[pixels.len()]), pixels.to_vec()).unwrap()))
            .with(IS_FIRST, Tensor::scalar_bool(is_first))
            .batched()
    }

    fn chosen(output: &PolicyOutput<LinearCarry>) -> usize {
        let values = output.action.get("action").unwrap().to_f32_vec();
        values.iter().position(|v| *v == 1.0).unwrap()
    }

    #[test]
    fn eval_mode_picks_argmax_and_breaks_ties_low() {
        let mut agent = agent(2, 3);
        let carry = agent.init_policy(1).unwrap();
        let out = agent.policy(carry, &batched_obs(&[255, 0], true), PolicyMode::Eval).unwrap();
        // All-zero parameters: every logit ties.
        assert_eq!(chosen(&out), 0);
        assert_eq!(out.action.get("action").unwrap().shape(), &[1, 3]);

        agent
            .set_params(LinearParams {
                weights: vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.5, 0.5]],
                bias: vec![0.0, 0.0, 0.0],
            })
            .unwrap();
        let carry = agent.init_policy(1).unwrap();
        let out = agent.policy(carry, &batched_obs(&[255, 0], true), PolicyMode::Eval).unwrap();
        assert_eq!(chosen(&out), 1);
    }

    #[test]
    fn carry_accumulates_and_resets_on_first() {
        let mut agent = agent(1, 2);
        agent
            .set_params(LinearParams {
                weights: vec![vec![0.0], vec![0.0]],
                bias: vec![1.0, 0.0],
            })
            .unwrap();

        let carry = agent.init_policy(1).unwrap();
        let out = agent.policy(carry, &batched_obs(&[0], true), PolicyMode::Eval).unwrap();
        assert_eq!(out.carry.trace[[0, 0]], 1.0);

        let out = agent.policy(out.carry, &batched_obs(&[0], false), PolicyMode::Eval).unwrap();
        assert_eq!(out.carry.trace[[0, 0]], 1.5);

        let out = agent.policy(out.carry, &batched_obs(&[0], true), PolicyMode::Eval).unwrap();
        assert_eq!(out.carry.trace[[0, 0]], 1.0);
    }

    #[test]
    fn explore_mode_samples_valid_actions() {
        let agent = agent(1, 4);
        let mut carry = agent.init_policy(1).unwrap();
        for _ in 0..20 {
            let out = agent.policy(carry, &batched_obs(&[10], false), PolicyMode::Explore).unwrap();
            assert!(chosen(&out) < 4);
            carry = out.carry;
        }
    }

    #[test]
    fn rejects_mismatched_parameters_and_inputs() {
        let mut agent = agent(2, 2);
        assert!(agent
            .set_params(LinearParams {
                weights: vec![vec![0.0; 3], vec![0.0; 3]],
                bias: vec![0.0; 2],
            })
            .is_err());

        let carry = agent.init_policy(1).unwrap();
        assert!(agent.policy(carry, &batched_obs(&[1, 2, 3], false), PolicyMode::Eval).is_err());

        let carry = agent.init_policy(1).unwrap();
        let unbatched = Channels::new().with(IMAGE, Tensor::U8(ArrayD::from_elem(IxDyn(&[2]), 0)));
        assert!(agent.policy(carry, &unbatched, PolicyMode::Eval).is_err());
    }

    #[test]
    fn checkpoint_state_round_trips_through_json() {
        let mut source = agent(2, 2);
        let params = LinearParams {
            weights: vec![vec![0.25, -1.0], vec![2.0, 0.0]],
            bias: vec![0.1, -0.1],
        };
        source.set_params(params.clone()).unwrap();

        let mut target = agent(2, 2);
        target.load_state(source.save_state().unwrap()).unwrap();
        assert_eq!(target.params(), &params);

        let mut wrong_shape = agent(3, 2);
        assert!(wrong_shape.load_state(source.save_state().unwrap()).is_err());
    }
}
