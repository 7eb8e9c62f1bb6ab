use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::error::{Result, TerminalError};
use crate::session::TerminalSize;

pub const CONFIG_PATH_ENV: &str = "AGENT_TERMINALS_CONFIG";

/// Bounded retry schedule for fitting a view that has no size yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 50,
            backoff_factor: 2,
            max_delay_ms: 400,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the zero-based `attempt` failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(attempt);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms.max(self.initial_delay_ms));
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Output chunks kept per session for replay.
    pub buffer_capacity: usize,
    /// Size used when a cold start is requested with an empty size.
    pub default_size: TerminalSize,
    pub fit_retry: RetryPolicy,
    /// Program for ad-hoc shells. Falls back to `$SHELL`.
    pub shell: Option<String>,
    pub term: String,
    /// Variables removed from the inherited environment before spawning.
    pub strip_env: Vec<String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            default_size: TerminalSize::default(),
            fit_retry: RetryPolicy::default(),
            shell: None,
            term: "xterm-256color".to_string(),
            // Agents refuse to start when they detect a parent agent session.
            strip_env: vec![
                "CLAUDECODE".to_string(),
                "CLAUDE_CODE_SESSION".to_string(),
                "CLAUDE_CODE_ENTRYPOINT".to_string(),
            ],
        }
    }
}

impl TerminalConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TerminalError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file. A missing or blank file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| TerminalError::Config(format!("{}: {}", path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_json_str(&content)
    }

    /// Loads from the file named by `AGENT_TERMINALS_CONFIG`, if set.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(TerminalError::Config(
                "buffer_capacity must be greater than 0".to_string(),
            ));
        }
        if self.default_size.is_empty() {
            return Err(TerminalError::Config(format!(
                "default_size must be non-empty, got {}",
                self.default_size
            )));
        }
        if self.fit_retry.max_attempts == 0 {
            return Err(TerminalError::Config(
                "fit_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
