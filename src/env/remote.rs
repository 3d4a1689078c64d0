//! HTTP-backed environment.
//!
//! Simulators that cannot run in-process (emulators, physics engines bound to
//! another runtime) sit behind a small JSON server. The server is expected to
//! expose:
//! - `GET  {base_url}/spaces` -- `{"obs_space": {..}, "act_space": {..}}`
//! - `POST {base_url}/reset`  -- body: `{"task": "<task>", "seed": <u64>}`
//! - `POST {base_url}/step`   -- body: `{"action": {<channel>: <tensor>}}`
//! - `POST {base_url}/close`
//!
//! `reset` and `step` answer with `{"obs": {<channel>: <tensor>}}`, tensors in
//! the wire format of [`crate::tensor::Tensor`].

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::traits::{Environment, Spaces};
use crate::tensor::{Action, Observation};

/// An environment that forwards every call to an external server.
#[derive(Debug)]
pub struct RemoteEnv {
    base_url: String,
    http: reqwest::blocking::Client,
    task: String,
    seed: u64,
    obs_space: Spaces,
    act_space: Spaces,
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct SpacesResponse {
    obs_space: Spaces,
    act_space: Spaces,
}

#[derive(Debug, Deserialize)]
struct ObservationResponse {
    obs: Observation,
}

impl RemoteEnv {
    /// Connect to the server at `base_url` and fetch its spaces.
    pub fn connect(base_url: &str, task: &str, seed: u64, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        let spaces: SpacesResponse = http
            .get(format!("{base_url}/spaces"))
            .send()
            .with_context(|| format!("failed to reach environment server at {base_url}"))
            .and_then(|resp| decode(resp, "spaces"))?;

        tracing::info!(
            url = %base_url,
            task,
            obs_channels = spaces.obs_space.len(),
            act_channels = spaces.act_space.len(),
            "connected to environment server"
        );

        Ok(Self {
            base_url,
            http,
            task: task.to_string(),
            seed,
            obs_space: spaces.obs_space,
            act_space: spaces.act_space,
            closed: false,
        })
    }

    fn post<T: DeserializeOwned>(&self, route: &str, body: &serde_json::Value) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}/{route}", self.base_url))
            .json(body)
            .send()
            .with_context(|| format!("failed to reach environment server on {route}"))?;
        decode(resp, route)
    }
}

fn decode<T: DeserializeOwned>(resp: reqwest::blocking::Response, route: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().unwrap_or_default();
        bail!("environment server returned {status} on {route}: {text}");
    }
    resp.json()
        .with_context(|| format!("failed to parse environment {route} response"))
}

impl Environment for RemoteEnv {
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
        let body = serde_json::json!({ "task": self.task, "seed": self.seed });
        let resp: ObservationResponse = self.post("reset", &body)?;
        tracing::debug!(channels = resp.obs.len(), "remote env reset");
        Ok(resp.obs)
    }

    fn step(&mut self, action: &Action) -> Result<Observation> {
        if self.closed {
            bail!("cannot step a closed environment");
        }
        let body = serde_json::json!({ "action": action });
        let resp: ObservationResponse = self.post("step", &body)?;
        Ok(resp.obs)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let resp = self
            .http
            .post(format!("{}/close", self.base_url))
            .send()
            .context("failed to reach environment server on close")?;
        if !resp.status().is_success() {
            bail!("environment server returned {} on close", resp.status());
        }
        tracing::debug!(url = %self.base_url, "remote env closed");
        Ok(())
    }
}
