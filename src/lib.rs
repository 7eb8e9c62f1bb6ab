//! Registry of process-backed terminal sessions for agents and quick shells.
//!
//! A session (process plus buffered output) outlives the views that display
//! it: closing a terminal dialog only detaches the view, and reopening it
//! replays the buffered history before live output resumes.

pub mod backend;
pub mod buffer;
#[cfg(feature = "desktop")]
pub mod commands;
pub mod config;
pub mod error;
pub mod registry;
pub mod resize;
pub mod session;
pub mod shell;
pub mod view;

use tracing_subscriber::EnvFilter;

pub use backend::{
    CommandSpec, PortablePtyBackend, ProcessBackend, ProcessExit, ProcessHandle, ProcessObserver,
    SpawnOptions, SpawnRequest,
};
pub use buffer::OutputBuffer;
pub use config::{RetryPolicy, TerminalConfig};
pub use error::{Result, TerminalError};
pub use registry::{Acquired, ResizeOutcome, SessionRegistry};
pub use resize::{FitOutcome, ResizeChannel, ResizeCoordinator, ResizeTrigger};
pub use session::{
    SessionEnd, SessionEnded, SessionHandle, SessionId, SessionKey, SessionKind, SessionSummary,
    TerminalSize,
};
pub use view::{
    AttachOutcome, AttachmentPhase, ChannelView, EventSink, EventView, TerminalEvent,
    TerminalView, ViewAttachments, ViewId, ViewReady,
};

/// Installs the fmt subscriber, honouring `RUST_LOG`. Safe to call twice.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent_terminals=info")),
        )
        .try_init();
}
