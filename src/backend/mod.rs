pub mod pty;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::session::{SessionKey, TerminalSize};

pub use pty::PortablePtyBackend;

/// Opaque identifier for a spawned process, minted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessHandle(u64);

impl ProcessHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pty-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// What the caller of `acquire` supplies for a cold start. Ignored on
/// reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub cwd: PathBuf,
    #[serde(default)]
    pub size: Option<TerminalSize>,
    /// Program to run. `None` starts the configured interactive shell.
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub key: SessionKey,
    pub cwd: PathBuf,
    pub size: TerminalSize,
    pub command: Option<CommandSpec>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub exit_code: Option<u32>,
}

impl ProcessExit {
    pub const fn with_code(code: u32) -> Self {
        Self {
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Push-style events from a running process.
///
/// Chunks for one handle must be delivered in the order the process wrote
/// them, and `on_exit` must come after the last chunk.
pub trait ProcessObserver: Send + Sync {
    fn on_output(&self, handle: ProcessHandle, chunk: Vec<u8>);
    fn on_exit(&self, handle: ProcessHandle, exit: ProcessExit);
}

/// Spawns and drives process-backed terminals.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    /// Fails with `TerminalError::BackendUnavailable` when the process cannot
    /// be started.
    async fn spawn(
        &self,
        request: SpawnRequest,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<ProcessHandle>;

    async fn write(&self, handle: ProcessHandle, bytes: &[u8]) -> Result<()>;

    async fn resize(&self, handle: ProcessHandle, size: TerminalSize) -> Result<()>;

    /// Idempotent: killing an unknown or already dead handle succeeds.
    async fn kill(&self, handle: ProcessHandle) -> Result<()>;
}
