// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy configuration and timing tunables.
//!
//! The gateway's configuration parser (out of scope here) produces a
//! [`ProxyConfig`]: the two channel endpoints, the opaque argument string
//! forwarded to the remote module, the lifecycle mode and the remote wait
//! interval. The polling intervals of the worker loops are tunables in
//! [`Timing`], overridable through `OUTPROC_*` environment variables.

use std::time::Duration;

use thiserror::Error;

use crate::transport;

/// Default wait interval for the create handshake and data receive timeout.
pub const DEFAULT_REMOTE_WAIT: Duration = Duration::from_millis(1000);

/// How `create` treats the remote handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// `create` waits for the handshake and fails if it fails.
    Sync,
    /// `create` returns immediately; handshake failure surfaces later as
    /// dropped sends.
    Async,
}

/// Configuration error. Creation fails without error-level logging: a bad
/// configuration is the caller's problem to report.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {which} endpoint: {reason}")]
    BadEndpoint {
        which: &'static str,
        reason: String,
    },
    #[error("module arguments must not be empty")]
    EmptyArgs,
}

/// Everything the proxy needs to bind one remote module.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Control channel endpoint (`ipc://...`).
    pub control_url: String,
    /// Message channel endpoint (`ipc://...`), also carried to the host
    /// inside the Create frame.
    pub message_url: String,
    /// Opaque argument string handed to the remote module.
    pub module_args: String,
    pub lifecycle: Lifecycle,
    /// Handshake retry interval and control/data receive timeout.
    pub remote_wait: Duration,
    pub timing: Timing,
}

impl ProxyConfig {
    pub fn new(
        control_url: impl Into<String>,
        message_url: impl Into<String>,
        module_args: impl Into<String>,
    ) -> ProxyConfig {
        ProxyConfig {
            control_url: control_url.into(),
            message_url: message_url.into(),
            module_args: module_args.into(),
            lifecycle: Lifecycle::Sync,
            remote_wait: DEFAULT_REMOTE_WAIT,
            timing: Timing::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        transport::parse_endpoint(&self.control_url).map_err(|e| ConfigError::BadEndpoint {
            which: "control",
            reason: e.to_string(),
        })?;
        transport::parse_endpoint(&self.message_url).map_err(|e| ConfigError::BadEndpoint {
            which: "message",
            reason: e.to_string(),
        })?;
        if self.module_args.is_empty() {
            return Err(ConfigError::EmptyArgs);
        }
        Ok(())
    }
}

/// Polling intervals and retry bounds. These are pacing knobs, not
/// correctness constants.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Yield between data-path loop iterations.
    pub data_poll: Duration,
    /// Sleep between supervisor loop iterations.
    pub supervisor_poll: Duration,
    /// Upper bound on create handshake attempts before giving up. The
    /// supervisor restarts the handshake on its next pass, so this bounds
    /// one round, not the re-attach policy.
    pub handshake_attempts: u32,
    /// Additional non-blocking send attempts for the Destroy notification.
    pub destroy_retries: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            data_poll: Duration::from_millis(1),
            supervisor_poll: Duration::from_millis(250),
            handshake_attempts: 30,
            destroy_retries: 10,
        }
    }
}

impl Timing {
    /// Defaults with `OUTPROC_DATA_POLL_MS`, `OUTPROC_SUPERVISOR_POLL_MS`
    /// and `OUTPROC_HANDSHAKE_ATTEMPTS` environment overrides applied.
    pub fn from_env() -> Timing {
        let mut timing = Timing::default();
        if let Some(ms) = env_u64("OUTPROC_DATA_POLL_MS") {
            timing.data_poll = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("OUTPROC_SUPERVISOR_POLL_MS") {
            timing.supervisor_poll = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("OUTPROC_HANDSHAKE_ATTEMPTS") {
            timing.handshake_attempts = n.min(u64::from(u32::MAX)) as u32;
        }
        timing
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[PROXY] ignoring non-numeric {}={}", name, raw);
            None
        }
    }
}
