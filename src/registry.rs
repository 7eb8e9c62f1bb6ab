use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{
    ProcessBackend, ProcessExit, ProcessHandle, ProcessObserver, SpawnOptions, SpawnRequest,
};
use crate::config::TerminalConfig;
use crate::error::{Result, TerminalError};
use crate::session::{
    QueuedResize, Session, SessionEnd, SessionHandle, SessionId, SessionKey, SessionSummary,
    TerminalSize,
};
use crate::view::{TerminalView, ViewId};

type SpawnOutcome = Option<Result<SessionHandle>>;

enum Slot {
    /// Cold start in flight. Later callers wait on `ready` instead of spawning.
    Pending {
        session: Arc<Session>,
        ready: watch::Receiver<SpawnOutcome>,
    },
    Live(Arc<Session>),
}

impl Slot {
    fn session(&self) -> &Arc<Session> {
        match self {
            Slot::Pending { session, .. } | Slot::Live(session) => session,
        }
    }
}

enum Lookup {
    Live(Arc<Session>),
    Pending(watch::Receiver<SpawnOutcome>),
}

enum Start {
    Join(watch::Receiver<SpawnOutcome>),
    Spawn(Arc<Session>, watch::Sender<SpawnOutcome>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "size", rename_all = "snake_case")]
pub enum ResizeOutcome {
    /// The backend now runs at this size.
    Applied(TerminalSize),
    /// Already at the requested size; no backend call.
    Unchanged,
    /// Handed to a resize already in flight for this session.
    Coalesced,
}

/// How `acquire` satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Acquired {
    ColdStart,
    /// Joined a cold start another caller had in flight.
    Joined,
    Reconnect,
}

/// Process-wide table of terminal sessions keyed by agent and session kind.
///
/// At most one process exists per key. Views come and go without touching
/// the process or its buffered output; only `terminate` or a process exit
/// removes an entry.
pub struct SessionRegistry {
    me: Weak<SessionRegistry>,
    backend: Arc<dyn ProcessBackend>,
    config: TerminalConfig,
    slots: Mutex<HashMap<SessionKey, Slot>>,
}

impl SessionRegistry {
    /// Builds a registry. An invalid config is logged, not rejected: a zero
    /// buffer capacity keeps one chunk and an empty default size is 80x24.
    pub fn new(backend: Arc<dyn ProcessBackend>, config: TerminalConfig) -> Arc<Self> {
        if let Err(e) = config.validate() {
            warn!(err = %e, "Invalid terminal config, falling back where needed");
        }
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            backend,
            config,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    /// Returns the session for `key`, spawning its process on first use.
    pub async fn acquire(&self, key: SessionKey, options: SpawnOptions) -> Result<SessionHandle> {
        self.acquire_tracked(key, options)
            .await
            .map(|(handle, _)| handle)
    }

    pub async fn acquire_tracked(
        &self,
        key: SessionKey,
        options: SpawnOptions,
    ) -> Result<(SessionHandle, Acquired)> {
        let start = {
            let mut slots = self.slots.lock();
            let existing = match slots.get(&key) {
                Some(Slot::Live(session)) => Some(Lookup::Live(session.clone())),
                Some(Slot::Pending { ready, .. }) => Some(Lookup::Pending(ready.clone())),
                None => None,
            };
            match existing {
                Some(Lookup::Live(session)) => {
                    debug!(key = %key, session_id = %session.id(), "Reconnecting to session");
                    return Ok((SessionHandle::new(session), Acquired::Reconnect));
                }
                Some(Lookup::Pending(ready)) => Start::Join(ready),
                None => {
                    let fallback = self.config.default_size.or(TerminalSize::default());
                    let size = options.size.unwrap_or(fallback).or(fallback);
                    let session =
                        Arc::new(Session::new(key.clone(), size, self.config.buffer_capacity));
                    let (ready_tx, ready) = watch::channel(None);
                    slots.insert(
                        key.clone(),
                        Slot::Pending {
                            session: session.clone(),
                            ready,
                        },
                    );
                    Start::Spawn(session, ready_tx)
                }
            }
        };

        let (session, ready_tx) = match start {
            Start::Join(ready) => {
                debug!(key = %key, "Waiting on in-flight spawn");
                return wait_for_spawn(&key, ready)
                    .await
                    .map(|handle| (handle, Acquired::Joined));
            }
            Start::Spawn(session, ready_tx) => (session, ready_tx),
        };

        let mut guard = PendingSpawn {
            registry: self,
            key: &key,
            session_id: session.id(),
            armed: true,
        };

        let request = SpawnRequest {
            key: key.clone(),
            cwd: options.cwd,
            size: session.last_known_size().unwrap_or_default(),
            command: options.command,
            env: options.env,
        };
        let observer = Arc::new(SessionObserver {
            registry: self.me.clone(),
            session: Arc::downgrade(&session),
        });
        info!(key = %key, session_id = %session.id(), "Cold-starting session");
        let spawned = self.backend.spawn(request, observer).await;
        let result = self.settle_spawn(&session, spawned).await;
        guard.armed = false;

        let _ = ready_tx.send(Some(result.clone()));
        result.map(|handle| (handle, Acquired::ColdStart))
    }

    async fn settle_spawn(
        &self,
        session: &Arc<Session>,
        spawned: Result<ProcessHandle>,
    ) -> Result<SessionHandle> {
        let key = session.key();
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.remove_if_current(key, session.id());
                warn!(key = %key, err = %e, "Spawn failed");
                return Err(match e {
                    TerminalError::BackendUnavailable(_) => e,
                    other => TerminalError::BackendUnavailable(other.to_string()),
                });
            }
        };
        session.set_process(handle);

        let promoted = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Pending { session: pending, .. }) if pending.id() == session.id() => {
                    if session.ended().is_some() {
                        // Exited before the spawn call returned.
                        slots.remove(key);
                    } else {
                        slots.insert(key.clone(), Slot::Live(session.clone()));
                    }
                    true
                }
                _ => false,
            }
        };

        if promoted {
            info!(key = %key, session_id = %session.id(), process = %handle, "Session started");
            return Ok(SessionHandle::new(session.clone()));
        }

        info!(key = %key, process = %handle, "Session terminated during spawn, killing process");
        if let Err(e) = self.backend.kill(handle).await {
            warn!(key = %key, err = %e, "Failed to kill orphaned process");
        }
        Err(TerminalError::SessionTerminated(key.to_string()))
    }

    /// Disassociates the live view, leaving the process and buffer alone.
    /// Returns whether a view was attached.
    pub fn detach_view(&self, key: &SessionKey) -> bool {
        self.detach_view_matching(key, None)
    }

    pub(crate) fn detach_view_matching(&self, key: &SessionKey, only: Option<&ViewId>) -> bool {
        let Some(session) = self.session(key) else {
            return false;
        };
        let detached = session.detach_view(only).is_some();
        if detached {
            debug!(key = %key, "View detached");
        }
        detached
    }

    pub(crate) fn attach_view(
        &self,
        handle: &SessionHandle,
        view: Arc<dyn TerminalView>,
    ) -> (usize, Option<Arc<dyn TerminalView>>) {
        handle.session().attach_view(view)
    }

    /// Kills the process and removes the entry. The entry is gone before the
    /// kill is awaited, so a racing `acquire` cold-starts a new session.
    pub async fn terminate(&self, key: &SessionKey) -> Result<()> {
        let Some(slot) = self.slots.lock().remove(key) else {
            return Ok(());
        };
        let session = slot.session().clone();
        info!(key = %key, session_id = %session.id(), "Terminating session");
        session.end(SessionEnd::Terminated);

        // A pending spawn kills its own process when it settles.
        if let Some(handle) = session.process() {
            if let Err(e) = self.backend.kill(handle).await {
                warn!(key = %key, err = %e, "Failed to kill session process");
            }
        }
        Ok(())
    }

    /// Terminates every session kind belonging to `agent_id`.
    pub async fn terminate_agent(&self, agent_id: &str) -> Result<()> {
        let keys: Vec<SessionKey> = self
            .slots
            .lock()
            .keys()
            .filter(|k| k.agent_id == agent_id)
            .cloned()
            .collect();
        for key in keys {
            self.terminate(&key).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = self.slots.lock().keys().cloned().collect();
        info!(count = keys.len(), "Shutting down terminal sessions");
        for key in keys {
            if let Err(e) = self.terminate(&key).await {
                warn!(key = %key, err = %e, "Failed to terminate session on shutdown");
            }
        }
    }

    /// Appends a chunk to the session's buffer and relays it to the live view.
    /// Returns false when no session exists for `key`.
    pub fn append_output(&self, key: &SessionKey, chunk: Vec<u8>) -> bool {
        match self.session(key) {
            Some(session) => session.append_output(chunk),
            None => false,
        }
    }

    /// Writes raw bytes to the session's process.
    pub async fn write(&self, key: &SessionKey, bytes: &[u8]) -> Result<()> {
        let handle = self.live_process(key)?;
        self.backend.write(handle, bytes).await.map_err(|e| {
            warn!(key = %key, err = %e, "Write to session failed");
            match e {
                TerminalError::WriteFailed(_) => e,
                other => TerminalError::WriteFailed(other.to_string()),
            }
        })
    }

    /// Pushes `size` to the process unless it already runs at that size.
    ///
    /// While a resize is in flight, newer requests replace each other and
    /// only the latest is sent once the in-flight call returns.
    pub async fn request_resize(
        &self,
        key: &SessionKey,
        size: TerminalSize,
    ) -> Result<ResizeOutcome> {
        if size.is_empty() {
            return Ok(ResizeOutcome::Unchanged);
        }
        let session = self.live_session(key)?;
        let handle = session
            .process()
            .ok_or_else(|| TerminalError::SessionNotFound(key.to_string()))?;

        match session.queue_resize(size) {
            QueuedResize::Unchanged => return Ok(ResizeOutcome::Unchanged),
            QueuedResize::Coalesced => return Ok(ResizeOutcome::Coalesced),
            QueuedResize::Drive => {}
        }

        let mut driver = ResizeDriver {
            session: &session,
            armed: true,
        };
        let channel = key.kind.resize_channel();
        let mut applied = None;
        let mut failure = None;
        while let Some(target) = session.next_resize() {
            debug!(key = %key, channel = ?channel, size = %target, "Resizing session");
            match self.backend.resize(handle, target).await {
                Ok(()) => {
                    session.confirm_resize(target);
                    applied = Some(target);
                    failure = None;
                }
                Err(e) => {
                    warn!(key = %key, size = %target, err = %e, "Resize failed");
                    failure = Some(e);
                }
            }
        }
        driver.armed = false;

        match (failure, applied) {
            (Some(e), _) => Err(match e {
                TerminalError::ResizeFailed(_) => e,
                other => TerminalError::ResizeFailed(other.to_string()),
            }),
            (None, Some(size)) => Ok(ResizeOutcome::Applied(size)),
            (None, None) => Ok(ResizeOutcome::Unchanged),
        }
    }

    fn handle_exit(&self, session: &Arc<Session>, exit: ProcessExit) {
        let key = session.key();
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Live(live)) if live.id() == session.id() => {
                    slots.remove(key);
                    true
                }
                _ => false,
            }
        };
        if session.end(SessionEnd::Exited(exit)) {
            info!(key = %key, session_id = %session.id(), exit_code = ?exit.exit_code, removed, "Session process exited");
        }
    }

    fn remove_if_current(&self, key: &SessionKey, id: SessionId) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.session().id() == id => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    fn session(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.slots.lock().get(key).map(|slot| slot.session().clone())
    }

    fn live_session(&self, key: &SessionKey) -> Result<Arc<Session>> {
        match self.slots.lock().get(key) {
            Some(Slot::Live(session)) => Ok(session.clone()),
            _ => Err(TerminalError::SessionNotFound(key.to_string())),
        }
    }

    fn live_process(&self, key: &SessionKey) -> Result<ProcessHandle> {
        self.live_session(key)?
            .process()
            .ok_or_else(|| TerminalError::SessionNotFound(key.to_string()))
    }

    /// The live session for `key`, if its process is running.
    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.live_session(key).ok().map(SessionHandle::new)
    }

    /// True when `key` has a live or in-flight entry.
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn session_id(&self, key: &SessionKey) -> Option<SessionId> {
        self.slots.lock().get(key).map(|slot| slot.session().id())
    }

    /// Diagnostic copy of the process handle backing `key`.
    pub fn process_handle(&self, key: &SessionKey) -> Option<ProcessHandle> {
        self.live_process(key).ok()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(session) => Some(SessionSummary {
                    key: session.key().clone(),
                    id: session.id(),
                    attached: session.has_view(),
                    buffered_chunks: session.buffered_chunks(),
                    last_known_size: session.last_known_size(),
                }),
                Slot::Pending { .. } => None,
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

async fn wait_for_spawn(
    key: &SessionKey,
    mut ready: watch::Receiver<SpawnOutcome>,
) -> Result<SessionHandle> {
    let settled = ready
        .wait_for(Option::is_some)
        .await
        .map(|outcome| outcome.clone());
    match settled {
        Ok(Some(result)) => result,
        _ => Err(TerminalError::BackendUnavailable(format!(
            "spawn for {key} was abandoned"
        ))),
    }
}

/// Clears the in-flight marker if the cold-starting future is dropped
/// before the spawn settles.
struct PendingSpawn<'a> {
    registry: &'a SessionRegistry,
    key: &'a SessionKey,
    session_id: SessionId,
    armed: bool,
}

impl Drop for PendingSpawn<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.remove_if_current(self.key, self.session_id) {
            debug!(key = %self.key, "Abandoned in-flight spawn");
        }
    }
}

/// Releases a session's in-flight resize slot if the driving future is
/// dropped mid-call.
struct ResizeDriver<'a> {
    session: &'a Session,
    armed: bool,
}

impl Drop for ResizeDriver<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.release_resize();
        }
    }
}

struct SessionObserver {
    registry: Weak<SessionRegistry>,
    session: Weak<Session>,
}

impl ProcessObserver for SessionObserver {
    fn on_output(&self, _handle: ProcessHandle, chunk: Vec<u8>) {
        if let Some(session) = self.session.upgrade() {
            session.append_output(chunk);
        }
    }

    fn on_exit(&self, handle: ProcessHandle, exit: ProcessExit) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match self.registry.upgrade() {
            Some(registry) => registry.handle_exit(&session, exit),
            None => {
                debug!(process = %handle, "Process exited after registry shutdown");
                session.end(SessionEnd::Exited(exit));
            }
        }
    }
}
