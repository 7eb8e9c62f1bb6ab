use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::backend::{ProcessExit, ProcessHandle};
use crate::buffer::OutputBuffer;
use crate::error::TerminalError;
use crate::view::{TerminalView, ViewId};

/// Lines of trailing output attached to a session-ended notification.
pub const LAST_OUTPUT_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// The live terminal of a running coding agent.
    PrimaryAgent,
    /// A quick terminal opened next to an agent on request.
    AdHocShell,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryAgent => "primary",
            Self::AdHocShell => "shell",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" | "primary-agent" | "agent" => Ok(Self::PrimaryAgent),
            "shell" | "ad-hoc-shell" | "terminal" => Ok(Self::AdHocShell),
            other => Err(TerminalError::InvalidKind(other.to_string())),
        }
    }
}

/// Registry key: one agent may own one session of each kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent_id: String,
    pub kind: SessionKind,
}

impl SessionKey {
    pub fn new(agent_id: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
        }
    }

    pub fn primary(agent_id: impl Into<String>) -> Self {
        Self::new(agent_id, SessionKind::PrimaryAgent)
    }

    pub fn shell(agent_id: impl Into<String>) -> Self {
        Self::new(agent_id, SessionKind::AdHocShell)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.kind)
    }
}

/// Identity of one cold-started session. A key reused after termination
/// gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// True when either dimension is zero, i.e. the container is not laid out.
    pub fn is_empty(self) -> bool {
        self.cols == 0 || self.rows == 0
    }

    pub fn or(self, fallback: TerminalSize) -> TerminalSize {
        if self.is_empty() {
            fallback
        } else {
            self
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SessionEnd {
    Exited(ProcessExit),
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEnded {
    pub session_id: SessionId,
    pub end: SessionEnd,
    pub last_output: Vec<String>,
}

struct Relay {
    buffer: OutputBuffer,
    view: Option<Arc<dyn TerminalView>>,
    ended: Option<SessionEnded>,
}

#[derive(Debug, Default)]
struct ResizeState {
    last_known: Option<TerminalSize>,
    requested: Option<TerminalSize>,
    in_flight: bool,
}

pub(crate) enum QueuedResize {
    /// The caller owns the in-flight slot and must drain requests.
    Drive,
    /// Folded into the request another caller is already driving.
    Coalesced,
    Unchanged,
}

/// One registry entry. Output relay state (buffer and view) sits behind a
/// single lock so replay-then-subscribe cannot interleave with an append.
pub(crate) struct Session {
    id: SessionId,
    key: SessionKey,
    process: Mutex<Option<ProcessHandle>>,
    relay: Mutex<Relay>,
    resize: Mutex<ResizeState>,
}

impl Session {
    pub(crate) fn new(key: SessionKey, size: TerminalSize, buffer_capacity: usize) -> Self {
        Self {
            id: SessionId::new(),
            key,
            process: Mutex::new(None),
            relay: Mutex::new(Relay {
                buffer: OutputBuffer::with_capacity(buffer_capacity),
                view: None,
                ended: None,
            }),
            resize: Mutex::new(ResizeState {
                last_known: Some(size),
                ..ResizeState::default()
            }),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn key(&self) -> &SessionKey {
        &self.key
    }

    pub(crate) fn process(&self) -> Option<ProcessHandle> {
        *self.process.lock()
    }

    pub(crate) fn set_process(&self, handle: ProcessHandle) {
        *self.process.lock() = Some(handle);
    }

    /// Stores the chunk and forwards it to the attached view, if any.
    pub(crate) fn append_output(&self, chunk: Vec<u8>) -> bool {
        let mut relay = self.relay.lock();
        if relay.ended.is_some() {
            return false;
        }
        if let Some(view) = relay.view.as_ref() {
            view.on_output(&chunk);
        }
        relay.buffer.append(chunk);
        true
    }

    /// Replays the buffer into `view` and makes it the live viewer.
    ///
    /// Returns the number of replayed chunks and the view it displaced. If the
    /// session already ended the view receives the replay followed by the end
    /// notification and is not retained.
    pub(crate) fn attach_view(
        &self,
        view: Arc<dyn TerminalView>,
    ) -> (usize, Option<Arc<dyn TerminalView>>) {
        let mut relay = self.relay.lock();
        let mut replayed = 0;
        for chunk in relay.buffer.iter() {
            view.on_output(chunk);
            replayed += 1;
        }
        if let Some(ended) = relay.ended.as_ref() {
            view.on_session_end(ended);
            return (replayed, None);
        }
        (replayed, relay.view.replace(view))
    }

    /// Drops the live viewer. With `only` set, the view is dropped only if it
    /// is that view.
    pub(crate) fn detach_view(&self, only: Option<&ViewId>) -> Option<Arc<dyn TerminalView>> {
        let mut relay = self.relay.lock();
        if let (Some(current), Some(id)) = (relay.view.as_ref(), only) {
            if current.id() != id {
                return None;
            }
        }
        relay.view.take()
    }

    /// Marks the session ended and notifies the live viewer. Only the first
    /// call has any effect.
    pub(crate) fn end(&self, end: SessionEnd) -> bool {
        let (view, ended) = {
            let mut relay = self.relay.lock();
            if relay.ended.is_some() {
                return false;
            }
            let ended = SessionEnded {
                session_id: self.id,
                end,
                last_output: relay.buffer.tail_lines(LAST_OUTPUT_LINES),
            };
            relay.ended = Some(ended.clone());
            (relay.view.take(), ended)
        };
        if let Some(view) = view {
            view.on_session_end(&ended);
        }
        true
    }

    pub(crate) fn ended(&self) -> Option<SessionEnded> {
        self.relay.lock().ended.clone()
    }

    pub(crate) fn has_view(&self) -> bool {
        self.relay.lock().view.is_some()
    }

    pub(crate) fn replay(&self) -> Vec<Vec<u8>> {
        self.relay.lock().buffer.replay()
    }

    pub(crate) fn buffered_chunks(&self) -> usize {
        self.relay.lock().buffer.len()
    }

    pub(crate) fn last_known_size(&self) -> Option<TerminalSize> {
        self.resize.lock().last_known
    }

    pub(crate) fn queue_resize(&self, size: TerminalSize) -> QueuedResize {
        let mut state = self.resize.lock();
        if state.in_flight {
            state.requested = Some(size);
            return QueuedResize::Coalesced;
        }
        if state.last_known == Some(size) {
            return QueuedResize::Unchanged;
        }
        state.requested = Some(size);
        state.in_flight = true;
        QueuedResize::Drive
    }

    /// Next size the driver should push. Releases the in-flight slot when
    /// nothing new is pending.
    pub(crate) fn next_resize(&self) -> Option<TerminalSize> {
        let mut state = self.resize.lock();
        match state.requested.take() {
            Some(size) if state.last_known != Some(size) => Some(size),
            _ => {
                state.in_flight = false;
                None
            }
        }
    }

    pub(crate) fn confirm_resize(&self, size: TerminalSize) {
        self.resize.lock().last_known = Some(size);
    }

    pub(crate) fn release_resize(&self) {
        let mut state = self.resize.lock();
        state.in_flight = false;
        state.requested = None;
    }
}

/// Caller-facing view of a registry entry.
///
/// Does not expose the process handle; writes and resizes go through the
/// registry.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn key(&self) -> &SessionKey {
        self.session.key()
    }

    pub fn replay(&self) -> Vec<Vec<u8>> {
        self.session.replay()
    }

    pub fn buffered_chunks(&self) -> usize {
        self.session.buffered_chunks()
    }

    pub fn has_view(&self) -> bool {
        self.session.has_view()
    }

    pub fn last_known_size(&self) -> Option<TerminalSize> {
        self.session.last_known_size()
    }

    pub fn ended(&self) -> Option<SessionEnded> {
        self.session.ended()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.session.id())
            .field("key", self.session.key())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub key: SessionKey,
    pub id: SessionId,
    pub attached: bool,
    pub buffered_chunks: usize,
    pub last_known_size: Option<TerminalSize>,
}
