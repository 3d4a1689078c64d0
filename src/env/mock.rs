//! Built-in deterministic environment.
//!
//! [`MockEnv`] renders a ball bouncing around a small arena with a paddle the
//! agent can move up or down. It needs no external process, which makes it
//! the backend for the `mock` suite and for tests of the rollout loop: the
//! episode length, reward schedule, frame encoding and a failure step are all
//! configurable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use ndarray::{Array3, ArrayD, IxDyn};

use super::traits::{Environment, Space, Spaces};
use crate::config::MockEnvConfig;
use crate::tensor::{Action, Channels, DType, Observation, Tensor, IMAGE, IS_FIRST, IS_LAST, REWARD};

/// Action channel the mock reads.
pub const ACTION_KEY: &str = "action";

/// A scripted bouncing-ball environment.
#[derive(Debug)]
pub struct MockEnv {
    config: MockEnvConfig,
    obs_space: Spaces,
    act_space: Spaces,
    float_images: bool,
    emit_image: bool,
    emit_reward: bool,
    fail_at_step: Option<usize>,
    seed: u64,
    episode: usize,
    step: usize,
    ball: (i64, i64),
    velocity: (i64, i64),
    paddle: i64,
    done: bool,
    closed: bool,
    close_calls: Arc<AtomicUsize>,
}

impl MockEnv {
    pub fn new(config: &MockEnvConfig) -> Self {
        let mut env = Self {
            config: config.clone(),
            obs_space: Spaces::new(),
            act_space: Spaces::new(),
            float_images: false,
            emit_image: true,
            emit_reward: true,
            fail_at_step: None,
            seed: 0,
            episode: 0,
            step: 0,
            ball: (0, 0),
            velocity: (1, 1),
            paddle: 0,
            done: true,
            closed: false,
            close_calls: Arc::new(AtomicUsize::new(0)),
        };
        env.rebuild_spaces();
        env
    }

    /// Offset the starting ball velocity per episode.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Emit `float32` images in `[0, 1]` instead of `uint8`.
    pub fn with_float_images(mut self) -> Self {
        self.float_images = true;
        self.rebuild_spaces();
        self
    }

    /// Omit the `image` channel entirely.
    pub fn without_images(mut self) -> Self {
        self.emit_image = false;
        self.rebuild_spaces();
        self
    }

    /// Omit the `reward` channel entirely.
    pub fn without_rewards(mut self) -> Self {
        self.emit_reward = false;
        self.rebuild_spaces();
        self
    }

    /// Fail on the `step`-th call to [`Environment::step`] (1-based) of any
    /// episode.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Shared counter of `close` calls, for lifecycle checks after the
    /// environment has been handed off.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.close_calls)
    }

    fn rebuild_spaces(&mut self) {
        let (h, w) = (self.config.height, self.config.width);
        let mut obs = Spaces::new();
        if self.emit_image {
            let dtype = if self.float_images { DType::F32 } else { DType::U8 };
            obs.insert(IMAGE.into(), Space::new(dtype, &[h, w, 3]));
        }
        if self.emit_reward {
            obs.insert(REWARD.into(), Space::new(DType::F32, &[]));
        }
        obs.insert(IS_FIRST.into(), Space::new(DType::Bool, &[]));
        obs.insert(IS_LAST.into(), Space::new(DType::Bool, &[]));
        obs.insert("is_terminal".into(), Space::new(DType::Bool, &[]));
        obs.insert("log/step".into(), Space::new(DType::I32, &[]));
        self.obs_space = obs;

        let mut act = Spaces::new();
        act.insert(
            ACTION_KEY.into(),
            Space::new(DType::F32, &[self.config.num_actions]),
        );
        act.insert("reset".into(), Space::new(DType::Bool, &[]));
        self.act_space = act;
    }

    fn render(&self) -> Array3<u8> {
        let (h, w) = (self.config.height, self.config.width);
        let mut frame = Array3::<u8>::from_elem((h, w, 3), 16);

        let paddle_len = (h / 5).max(1) as i64;
        for y in self.paddle..(self.paddle + paddle_len).min(h as i64) {
            for c in 0..3 {
                frame[[y as usize, 0, c]] = 200;
            }
        }

        let (bx, by) = self.ball;
        for y in by - 1..=by + 1 {
            for x in bx - 1..=bx + 1 {
                if (0..h as i64).contains(&y) && (0..w as i64).contains(&x) {
                    frame[[y as usize, x as usize, 0]] = 255;
                    frame[[y as usize, x as usize, 1]] = 255;
                    frame[[y as usize, x as usize, 2]] = 255;
                }
            }
        }
        frame
    }

    fn observe(&self, reward: f32, is_first: bool) -> Observation {
        let is_last = self.done;
        let mut obs = Channels::new()
            .with(IS_FIRST, Tensor::scalar_bool(is_first))
            .with(IS_LAST, Tensor::scalar_bool(is_last))
            .with("is_terminal", Tensor::scalar_bool(is_last))
            .with(
                "log/step",
                Tensor::I32(ArrayD::from_elem(IxDyn(&[]), self.step as i32)),
            );
        if self.emit_reward {
            obs.insert(REWARD, Tensor::scalar_f32(reward));
        }
        if self.emit_image {
            let frame = self.render().into_dyn();
            let image = if self.float_images {
                Tensor::F32(frame.mapv(|v| v as f32 / 255.0))
            } else {
                Tensor::U8(frame)
            };
            obs.insert(IMAGE, image);
        }
        obs
    }

    /// Index of the largest action component (ties resolve to the lowest).
    fn decode_action(&self, action: &Action) -> Result<usize> {
        let Some(tensor) = action.get(ACTION_KEY) else {
            bail!("mock env expects an '{ACTION_KEY}' channel");
        };
        let values = tensor.to_f32_vec();
        if values.len() != self.config.num_actions {
            bail!(
                "mock env expects {} action components, got {}",
                self.config.num_actions,
                values.len()
            );
        }
        let mut best = 0;
        for (i, v) in values.iter().enumerate() {
            if *v > values[best] {
                best = i;
            }
        }
        Ok(best)
    }

    fn advance_ball(&mut self) {
        let (h, w) = (self.config.height as i64, self.config.width as i64);
        let (mut x, mut y) = (self.ball.0 + self.velocity.0, self.ball.1 + self.velocity.1);
        if x < 0 || x >= w {
            self.velocity.0 = -self.velocity.0;
            x = x.clamp(0, w - 1);
        }
        if y < 0 || y >= h {
            self.velocity.1 = -self.velocity.1;
            y = y.clamp(0, h - 1);
        }
        self.ball = (x, y);
    }
}

impl Environment for MockEnv {
    fn obs_space(&self) -> &Spaces {
        &self.obs_space
    }

    fn act_space(&self) -> &Spaces {
        &self.act_space
    }

    fn reset(&mut self) -> Result<Observation> {
        if self.closed {
            bail!("cannot reset a closed environment");
        }
        let variant = (self.seed as usize + self.episode) % 3;
        self.step = 0;
        self.done = false;
        self.ball = (
            self.config.width as i64 / 2,
            self.config.height as i64 / 2,
        );
        self.velocity = (1 + variant as i64 % 2, 1 + variant as i64);
        self.paddle = self.config.height as i64 / 2;
        self.episode += 1;

        tracing::debug!(episode = self.episode, "mock env reset");
        Ok(self.observe(0.0, true))
    }

    fn step(&mut self, action: &Action) -> Result<Observation> {
        if self.closed {
            bail!("cannot step a closed environment");
        }
        if self.done {
            bail!("cannot step in a terminated episode");
        }

        let choice = self.decode_action(action)?;
        self.step += 1;
        if self.fail_at_step == Some(self.step) {
            bail!("mock env failure injected at step {}", self.step);
        }

        let max_paddle = self.config.height as i64 - 1;
        match choice {
            1 => self.paddle = (self.paddle - 1).max(0),
            2 => self.paddle = (self.paddle + 1).min(max_paddle),
            _ => {}
        }
        self.advance_ball();

        let rewarded = self.config.reward_every > 0 && self.step % self.config.reward_every == 0;
        let reward = if rewarded { self.config.reward } else { 0.0 };
        self.done = self.config.episode_length.is_some_and(|n| self.step >= n);

        Ok(self.observe(reward, false))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(episodes = self.episode, "mock env closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(episode_length: Option<usize>) -> MockEnvConfig {
        MockEnvConfig {
            height: 8,
            width: 10,
            episode_length,
            reward_every: 2,
            reward: 0.5,
            num_actions: 3,
        }
    }

    fn noop() -> Action {
        Channels::new().with(ACTION_KEY, Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, 0.0, 0.0]).unwrap()))
    }

    #[test]
    fn episode_ends_after_configured_length() {
        let mut env = MockEnv::new(&config(Some(3)));
        let first = env.reset().unwrap();
        assert!(first.is_first());
        assert!(!first.is_last());
        assert_eq!(first.image().unwrap().shape(), &[8, 10, 3]);

        assert!(!env.step(&noop()).unwrap().is_last());
        assert!(!env.step(&noop()).unwrap().is_last());
        assert!(env.step(&noop()).unwrap().is_last());
        assert!(env.step(&noop()).is_err());
    }

    #[test]
    fn rewards_follow_schedule() {
        let mut env = MockEnv::new(&config(None));
        env.reset().unwrap();
        let rewards: Vec<f64> = (0..4).map(|_| env.step(&noop()).unwrap().reward()).collect();
        assert_eq!(rewards, vec![0.0, 0.5, 0.0, 0.5]);
    }

    #[test]
    fn optional_channels_can_be_disabled() {
        let mut env = MockEnv::new(&config(None)).without_images().without_rewards();
        let obs = env.reset().unwrap();
        assert!(obs.image().is_none());
        assert!(!obs.contains(REWARD));
        assert!(!env.obs_space().contains_key(IMAGE));

        let mut float_env = MockEnv::new(&config(None)).with_float_images();
        let obs = float_env.reset().unwrap();
        assert_eq!(obs.image().unwrap().dtype(), DType::F32);
    }

    #[test]
    fn missing_action_channel_is_an_error() {
        let mut env = MockEnv::new(&config(None));
        env.reset().unwrap();
        assert!(env.step(&Channels::new()).is_err());
    }

    #[test]
    fn injected_failure_and_close_counter() {
        let mut env = MockEnv::new(&config(None)).failing_at(2);
        let counter = env.close_counter();
        env.reset().unwrap();
        env.step(&noop()).unwrap();
        assert!(env.step(&noop()).is_err());

        env.close().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(env.reset().is_err());
    }
}
