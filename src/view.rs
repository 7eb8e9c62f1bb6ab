use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::SpawnOptions;
use crate::error::Result;
use crate::registry::{Acquired, SessionRegistry};
use crate::resize::{FitOutcome, ResizeCoordinator, ResizeTrigger};
use crate::session::{SessionEnd, SessionEnded, SessionId, SessionKey, TerminalSize};

/// Identity of one UI terminal widget instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(String);

impl ViewId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewReady {
    pub session_id: SessionId,
    pub reconnected: bool,
}

/// A UI terminal widget as seen by the registry.
///
/// Output callbacks run while the session's relay lock is held, so
/// implementations must hand data off without calling back into the
/// registry.
pub trait TerminalView: Send + Sync {
    fn id(&self) -> &ViewId;

    fn on_output(&self, chunk: &[u8]);

    /// Called once when the session behind the view ends.
    fn on_session_end(&self, ended: &SessionEnded);

    /// Called before history replay begins.
    fn on_ready(&self, _ready: &ViewReady) {}

    /// Best-fit grid for the widget's current pixel size, `None` or an empty
    /// size while it is not laid out.
    fn fit(&self) -> Option<TerminalSize>;

    /// Releases widget-side resources on detach.
    fn dispose(&self) {}
}

/// Messages delivered to a frontend terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum TerminalEvent {
    Ready {
        session_id: SessionId,
        reconnected: bool,
    },
    /// Base64-encoded output bytes.
    Data(String),
    Exit {
        exit_code: Option<u32>,
        terminated: bool,
        last_output: Vec<String>,
    },
}

impl TerminalEvent {
    pub fn data(chunk: &[u8]) -> Self {
        TerminalEvent::Data(BASE64.encode(chunk))
    }

    /// Decodes a `Data` payload back into bytes.
    pub fn decode_data(&self) -> Option<Vec<u8>> {
        match self {
            TerminalEvent::Data(encoded) => BASE64.decode(encoded).ok(),
            _ => None,
        }
    }
}

impl From<&SessionEnded> for TerminalEvent {
    fn from(ended: &SessionEnded) -> Self {
        let (exit_code, terminated) = match &ended.end {
            SessionEnd::Exited(exit) => (exit.exit_code, false),
            SessionEnd::Terminated => (None, true),
        };
        TerminalEvent::Exit {
            exit_code,
            terminated,
            last_output: ended.last_output.clone(),
        }
    }
}

/// Destination for `TerminalEvent`s. Returns false once the receiver is gone.
pub trait EventSink: Send + Sync {
    fn send(&self, event: TerminalEvent) -> bool;
}

impl EventSink for mpsc::UnboundedSender<TerminalEvent> {
    fn send(&self, event: TerminalEvent) -> bool {
        mpsc::UnboundedSender::send(self, event).is_ok()
    }
}

/// `TerminalView` that serialises everything into `TerminalEvent`s. The
/// frontend reports its measured grid through `set_size`.
pub struct EventView<S> {
    id: ViewId,
    sink: S,
    size: Mutex<Option<TerminalSize>>,
}

impl<S: EventSink> EventView<S> {
    pub fn new(id: ViewId, sink: S, size: Option<TerminalSize>) -> Self {
        Self {
            id,
            sink,
            size: Mutex::new(size),
        }
    }

    pub fn set_size(&self, size: TerminalSize) {
        *self.size.lock() = Some(size);
    }

    fn emit(&self, event: TerminalEvent) {
        if !self.sink.send(event) {
            debug!(view = %self.id, "Terminal view receiver dropped");
        }
    }
}

pub type ChannelView = EventView<mpsc::UnboundedSender<TerminalEvent>>;

impl ChannelView {
    /// A view backed by an unbounded channel, plus the receiving end.
    pub fn channel(
        id: ViewId,
        size: Option<TerminalSize>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(id, tx, size)), rx)
    }
}

impl<S: EventSink> TerminalView for EventView<S> {
    fn id(&self) -> &ViewId {
        &self.id
    }

    fn on_output(&self, chunk: &[u8]) {
        self.emit(TerminalEvent::data(chunk));
    }

    fn on_session_end(&self, ended: &SessionEnded) {
        self.emit(TerminalEvent::from(ended));
    }

    fn on_ready(&self, ready: &ViewReady) {
        self.emit(TerminalEvent::Ready {
            session_id: ready.session_id,
            reconnected: ready.reconnected,
        });
    }

    fn fit(&self) -> Option<TerminalSize> {
        *self.size.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentPhase {
    Unmounted,
    /// Spawn or reconnect in flight.
    Initializing,
    /// Replay done, live relay active.
    Live,
    /// View disposed, session still running.
    Detached,
    /// Session gone. A later attach cold-starts a new session.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachOutcome {
    Attached {
        session_id: SessionId,
        reconnected: bool,
        replayed: usize,
    },
    /// The same view is already attached or attaching; nothing was done.
    AlreadyAttached,
    /// The view was detached while its session was being acquired.
    Abandoned,
}

struct Attachment {
    view: Arc<dyn TerminalView>,
    phase: AttachmentPhase,
    session_id: Option<SessionId>,
}

/// Binds UI terminal widgets to registry sessions.
pub struct ViewAttachments {
    registry: Arc<SessionRegistry>,
    coordinator: ResizeCoordinator,
    attachments: Mutex<HashMap<SessionKey, Attachment>>,
}

impl ViewAttachments {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let coordinator = ResizeCoordinator::new(registry.clone(), registry.config().fit_retry);
        Self::with_coordinator(registry, coordinator)
    }

    pub fn with_coordinator(registry: Arc<SessionRegistry>, coordinator: ResizeCoordinator) -> Self {
        Self {
            registry,
            coordinator,
            attachments: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Binds `view` to the session for `key`, creating the session if needed.
    ///
    /// Buffered output is replayed into the view before live output, then
    /// the view is fitted. Calling again with the same view while it is
    /// attaching or attached does nothing.
    pub async fn attach(
        &self,
        key: SessionKey,
        view: Arc<dyn TerminalView>,
        options: SpawnOptions,
    ) -> Result<AttachOutcome> {
        {
            let mut attachments = self.attachments.lock();
            if let Some(current) = attachments.get(&key) {
                let same_view = current.view.id() == view.id();
                let busy = match current.phase {
                    AttachmentPhase::Initializing => true,
                    AttachmentPhase::Live => {
                        current.session_id.is_some()
                            && current.session_id == self.registry.session_id(&key)
                    }
                    _ => false,
                };
                if same_view && busy {
                    debug!(key = %key, view = %view.id(), "Ignoring repeated attach");
                    return Ok(AttachOutcome::AlreadyAttached);
                }
            }
            attachments.insert(
                key.clone(),
                Attachment {
                    view: view.clone(),
                    phase: AttachmentPhase::Initializing,
                    session_id: None,
                },
            );
        }

        let (handle, acquired) = match self.registry.acquire_tracked(key.clone(), options).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.clear_if_initializing(&key, &view);
                return Err(e);
            }
        };

        if !self.is_initializing(&key, &view) {
            debug!(key = %key, view = %view.id(), "View detached before attach completed");
            return Ok(AttachOutcome::Abandoned);
        }

        let reconnected = acquired == Acquired::Reconnect;
        view.on_ready(&ViewReady {
            session_id: handle.id(),
            reconnected,
        });
        let (replayed, displaced) = self.registry.attach_view(&handle, view.clone());
        if let Some(previous) = displaced.filter(|prev| prev.id() != view.id()) {
            debug!(key = %key, view = %previous.id(), "Replacing attached view");
            previous.dispose();
        }

        let promoted = match self.attachments.lock().get_mut(&key) {
            Some(current)
                if current.phase == AttachmentPhase::Initializing
                    && current.view.id() == view.id() =>
            {
                current.phase = AttachmentPhase::Live;
                current.session_id = Some(handle.id());
                true
            }
            _ => false,
        };
        if !promoted {
            // Detached or replaced while replaying.
            self.registry.detach_view_matching(&key, Some(view.id()));
            debug!(key = %key, view = %view.id(), "View detached during replay");
            return Ok(AttachOutcome::Abandoned);
        }
        info!(key = %key, view = %view.id(), session_id = %handle.id(), reconnected, replayed, "View attached");

        if handle.ended().is_none() {
            if let Err(e) = self
                .coordinator
                .fit(&key, view.as_ref(), ResizeTrigger::Mount)
                .await
            {
                warn!(key = %key, err = %e, "Initial fit failed");
            }
        }

        Ok(AttachOutcome::Attached {
            session_id: handle.id(),
            reconnected,
            replayed,
        })
    }

    /// Disposes the view for `key` and detaches it from its session. The
    /// session keeps running. Idempotent.
    pub fn detach(&self, key: &SessionKey) -> bool {
        let view = {
            let mut attachments = self.attachments.lock();
            match attachments.get_mut(key) {
                Some(current)
                    if matches!(
                        current.phase,
                        AttachmentPhase::Initializing | AttachmentPhase::Live
                    ) =>
                {
                    current.phase = AttachmentPhase::Detached;
                    current.view.clone()
                }
                _ => return false,
            }
        };
        view.dispose();
        self.registry.detach_view_matching(key, Some(view.id()));
        info!(key = %key, view = %view.id(), "View detached");
        true
    }

    /// Forwards user input verbatim to the session's process.
    pub async fn input(&self, key: &SessionKey, bytes: &[u8]) -> Result<()> {
        self.registry.write(key, bytes).await
    }

    /// Re-fits the attached view after a container or layout change.
    pub async fn refit(&self, key: &SessionKey, trigger: ResizeTrigger) -> Result<Option<FitOutcome>> {
        let view = match self.attachments.lock().get(key) {
            Some(current) if current.phase == AttachmentPhase::Live => current.view.clone(),
            _ => return Ok(None),
        };
        self.coordinator.fit(key, view.as_ref(), trigger).await.map(Some)
    }

    /// Pushes a size measured by the frontend.
    pub async fn resize(&self, key: &SessionKey, size: TerminalSize) -> Result<FitOutcome> {
        self.coordinator.apply(key, size).await
    }

    /// Ends the session: kills the process, removes the registry entry and
    /// disposes the view.
    pub async fn terminate(&self, key: &SessionKey) -> Result<()> {
        let view = {
            let mut attachments = self.attachments.lock();
            attachments.get_mut(key).map(|current| {
                current.phase = AttachmentPhase::Terminated;
                current.view.clone()
            })
        };
        self.registry.terminate(key).await?;
        if let Some(view) = view {
            view.dispose();
        }
        Ok(())
    }

    pub fn phase(&self, key: &SessionKey) -> AttachmentPhase {
        let attachments = self.attachments.lock();
        let Some(current) = attachments.get(key) else {
            return AttachmentPhase::Unmounted;
        };
        match current.phase {
            AttachmentPhase::Live | AttachmentPhase::Detached
                if current.session_id.is_some()
                    && current.session_id != self.registry.session_id(key) =>
            {
                AttachmentPhase::Terminated
            }
            phase => phase,
        }
    }

    fn is_initializing(&self, key: &SessionKey, view: &Arc<dyn TerminalView>) -> bool {
        self.attachments.lock().get(key).is_some_and(|current| {
            current.phase == AttachmentPhase::Initializing && current.view.id() == view.id()
        })
    }

    fn clear_if_initializing(&self, key: &SessionKey, view: &Arc<dyn TerminalView>) {
        let mut attachments = self.attachments.lock();
        if attachments.get(key).is_some_and(|current| {
            current.phase == AttachmentPhase::Initializing && current.view.id() == view.id()
        }) {
            attachments.remove(key);
        }
    }
}
