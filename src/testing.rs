//! Scripted agents, environments and encoders shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use ndarray::{ArrayD, IxDyn};

use crate::agent::{Agent, PolicyMode, PolicyOutput};
use crate::env::{Environment, Space, Spaces};
use crate::tensor::{Action, Channels, DType, Observation, Tensor, IMAGE, IS_FIRST, IS_LAST, REWARD};
use crate::video::{Frame, FrameEncoder};

/// A unique scratch directory path (not created).
pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("evalreel_{label}_{}", uuid::Uuid::new_v4()))
}

/// Names of the files in `dir` (empty when it does not exist).
pub(crate) fn file_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// An environment whose every channel is driven by a script.
pub(crate) struct ScriptedEnv {
    /// Step (1-based) that reports `is_last`; `None` never ends.
    pub end_at: Option<usize>,
    /// Reward of step `i` is `rewards[(i - 1) % len]`; `None` omits the
    /// channel. An empty script omits it on every step.
    pub rewards: Vec<Option<f32>>,
    /// Steps divisible by this carry an image; 0 never does.
    pub image_every: usize,
    pub float_images: bool,
    /// Step (1-based) that fails.
    pub fail_at: Option<usize>,
    pub step: usize,
    pub resets: usize,
    /// Shapes of every action channel received, in order.
    pub action_shapes: Vec<Vec<usize>>,
    pub closes: Arc<AtomicUsize>,
    obs_space: Spaces,
    act_space: Spaces,
}

impl ScriptedEnv {
    pub fn new(end_at: Option<usize>) -> Self {
        let mut obs_space = Spaces::new();
        obs_space.insert(IMAGE.into(), Space::new(DType::U8, &[2, 2, 3]));
        obs_space.insert(REWARD.into(), Space::new(DType::F32, &[]));
        let mut act_space = Spaces::new();
        act_space.insert("action".into(), Space::new(DType::F32, &[2]));
        Self {
            end_at,
            rewards: vec![Some(1.0)],
            image_every: 1,
            float_images: false,
            fail_at: None,
            step: 0,
            resets: 0,
            action_shapes: Vec::new(),
            closes: Arc::new(AtomicUsize::new(0)),
            obs_space,
            act_space,
        }
    }

    fn observe(&self, reward: Option<f32>, with_image: bool, is_first: bool) -> Observation {
        let mut obs = Channels::new()
            .with(IS_FIRST, Tensor::scalar_bool(is_first))
            .with(
                IS_LAST,
                Tensor::scalar_bool(self.end_at.is_some_and(|n| self.step >= n)),
            );
        obs.insert(
            "log/step",
            Tensor::I32(ArrayD::from_elem(IxDyn(&[]), self.step as i32)),
        );
        if let Some(r) = reward {
            obs.insert(REWARD, Tensor::scalar_f32(r));
        }
        if with_image {
            let image = if self.float_images {
                Tensor::F32(ArrayD::zeros(IxDyn(&[2, 2, 3])))
            } else {
                Tensor::U8(ArrayD::from_elem(IxDyn(&[2, 2, 3]), self.step as u8))
            };
            obs.insert(IMAGE, image);
        }
        obs
    }
}

impl Environment for ScriptedEnv {
    fn obs_space(&self) -> &Spaces {
        &self.obs_space
    }

    fn act_space(&self) -> &Spaces {
        &self.act_space
    }

    fn reset(&mut self) -> Result<Observation> {
        self.step = 0;
        self.resets += 1;
        Ok(self.observe(Some(0.0), true, true))
    }

    fn step(&mut self, action: &Action) -> Result<Observation> {
        self.step += 1;
        if self.fail_at == Some(self.step) {
            bail!("scripted failure at step {}", self.step);
        }
        for (_, tensor) in action.iter() {
            self.action_shapes.push(tensor.shape().to_vec());
        }
        let reward = if self.rewards.is_empty() {
            None
        } else {
            self.rewards[(self.step - 1) % self.rewards.len()]
        };
        let with_image = self.image_every > 0 && self.step % self.image_every == 0;
        Ok(self.observe(reward, with_image, false))
    }

    fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Carry of [`ConstantAgent`]: which episode it belongs to and how many
/// policy calls it has been threaded through.
#[derive(Debug)]
pub(crate) struct CountingCarry {
    pub episode: usize,
    pub calls: usize,
}

/// Always answers with the same action; checks that inputs are batched.
#[derive(Default)]
pub(crate) struct ConstantAgent {
    /// Fail on this policy call (1-based, counted across the session).
    pub fail_at_call: Option<usize>,
    pub inits: Cell<usize>,
    pub total_calls: Cell<usize>,
    /// `(episode, calls)` of every carry received.
    pub seen: RefCell<Vec<(usize, usize)>>,
    /// Every observation channel name the policy was shown.
    pub seen_keys: RefCell<BTreeSet<String>>,
}

impl ConstantAgent {
    pub fn inits(&self) -> usize {
        self.inits.get()
    }
}

impl Agent for ConstantAgent {
    type Carry = CountingCarry;

    fn init_policy(&self, batch_size: usize) -> Result<CountingCarry> {
        assert_eq!(batch_size, 1);
        self.inits.set(self.inits.get() + 1);
        Ok(CountingCarry {
            episode: self.inits.get(),
            calls: 0,
        })
    }

    fn policy(
        &self,
        carry: CountingCarry,
        obs: &Observation,
        mode: PolicyMode,
    ) -> Result<PolicyOutput<CountingCarry>> {
        assert_eq!(mode, PolicyMode::Eval);
        self.total_calls.set(self.total_calls.get() + 1);
        if self.fail_at_call == Some(self.total_calls.get()) {
            bail!("scripted agent failure");
        }
        for (name, tensor) in obs.iter() {
            if tensor.shape().first() != Some(&1) {
                bail!("channel '{name}' is not batched: {:?}", tensor.shape());
            }
        }
        self.seen.borrow_mut().push((carry.episode, carry.calls));
        self.seen_keys
            .borrow_mut()
            .extend(obs.keys().map(str::to_string));

        let action = Channels::new().with(
            "action",
            Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![1.0, 0.0])?),
        );
        Ok(PolicyOutput {
            carry: CountingCarry {
                episode: carry.episode,
                calls: carry.calls + 1,
            },
            action,
            aux: Channels::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Writes a placeholder file and remembers the frame count of every call.
#[derive(Default)]
pub(crate) struct RecordingEncoder {
    pub calls: RefCell<Vec<(PathBuf, usize)>>,
}

impl FrameEncoder for RecordingEncoder {
    fn extension(&self) -> &str {
        "mp4"
    }

    fn encode(&self, path: &Path, frames: &[Frame]) -> Result<()> {
        std::fs::write(path, format!("{} frames", frames.len()))?;
        self.calls.borrow_mut().push((path.to_path_buf(), frames.len()));
        Ok(())
    }
}
