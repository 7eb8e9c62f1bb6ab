use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tauri::ipc::Channel;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{Manager, RunEvent, Runtime, State};
use tracing::info;

use crate::backend::{CommandSpec, PortablePtyBackend, SpawnOptions};
use crate::config::TerminalConfig;
use crate::error::TerminalError;
use crate::registry::SessionRegistry;
use crate::resize::{FitOutcome, ResizeTrigger};
use crate::session::{SessionKey, SessionKind, SessionSummary, TerminalSize};
use crate::view::{AttachOutcome, EventSink, EventView, TerminalEvent, ViewAttachments, ViewId};

type FrontendView = EventView<Channel<TerminalEvent>>;

impl EventSink for Channel<TerminalEvent> {
    fn send(&self, event: TerminalEvent) -> bool {
        Channel::send(self, event).is_ok()
    }
}

pub struct TerminalState {
    attachments: ViewAttachments,
    views: Mutex<HashMap<SessionKey, Arc<FrontendView>>>,
}

impl TerminalState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            attachments: ViewAttachments::new(registry),
            views: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.attachments.registry()
    }
}

#[tauri::command]
#[allow(clippy::too_many_arguments)]
pub async fn open_terminal(
    state: State<'_, TerminalState>,
    agent_id: String,
    kind: SessionKind,
    view_id: String,
    cwd: String,
    cols: u16,
    rows: u16,
    command: Option<CommandSpec>,
    env: Option<HashMap<String, String>>,
    on_output: Channel<TerminalEvent>,
) -> Result<AttachOutcome, TerminalError> {
    let key = SessionKey::new(agent_id, kind);
    let size = TerminalSize::new(cols, rows);
    info!(key = %key, view = %view_id, cwd = %cwd, size = %size, "Opening terminal");

    let view = Arc::new(EventView::new(
        ViewId::new(view_id),
        on_output,
        Some(size).filter(|s| !s.is_empty()),
    ));
    state.views.lock().insert(key.clone(), view.clone());

    let options = SpawnOptions {
        cwd: PathBuf::from(cwd),
        size: Some(size),
        command,
        env: env.unwrap_or_default().into_iter().collect(),
    };
    state.attachments.attach(key, view, options).await
}

#[tauri::command]
pub async fn write_terminal(
    state: State<'_, TerminalState>,
    agent_id: String,
    kind: SessionKind,
    data: String,
) -> Result<(), TerminalError> {
    let key = SessionKey::new(agent_id, kind);
    state.attachments.input(&key, data.as_bytes()).await
}

#[tauri::command]
pub async fn resize_terminal(
    state: State<'_, TerminalState>,
    agent_id: String,
    kind: SessionKind,
    cols: u16,
    rows: u16,
    trigger: Option<ResizeTrigger>,
) -> Result<Option<FitOutcome>, TerminalError> {
    let key = SessionKey::new(agent_id, kind);
    let view = state.views.lock().get(&key).cloned();
    if let Some(view) = view {
        view.set_size(TerminalSize::new(cols, rows));
    }
    state
        .attachments
        .refit(&key, trigger.unwrap_or(ResizeTrigger::ContainerResized))
        .await
}

/// Closes the dialog. The session keeps running.
#[tauri::command]
pub fn close_terminal(
    state: State<'_, TerminalState>,
    agent_id: String,
    kind: SessionKind,
) -> Result<bool, TerminalError> {
    let key = SessionKey::new(agent_id, kind);
    state.views.lock().remove(&key);
    Ok(state.attachments.detach(&key))
}

/// Ends the session and kills its process.
#[tauri::command]
pub async fn terminate_terminal(
    state: State<'_, TerminalState>,
    agent_id: String,
    kind: SessionKind,
) -> Result<(), TerminalError> {
    let key = SessionKey::new(agent_id, kind);
    state.views.lock().remove(&key);
    state.attachments.terminate(&key).await
}

#[tauri::command]
pub fn list_terminals(state: State<'_, TerminalState>) -> Vec<SessionSummary> {
    state.registry().sessions()
}

/// Tauri plugin that owns the session registry for the app's lifetime.
pub fn init<R: Runtime>(config: TerminalConfig) -> TauriPlugin<R> {
    Builder::new("terminals")
        .invoke_handler(tauri::generate_handler![
            open_terminal,
            write_terminal,
            resize_terminal,
            close_terminal,
            terminate_terminal,
            list_terminals,
        ])
        .setup(move |app, _api| {
            config.validate()?;
            let backend = Arc::new(PortablePtyBackend::new(config.clone()));
            app.manage(TerminalState::new(SessionRegistry::new(backend, config)));
            Ok(())
        })
        .on_event(|app, event| {
            if let RunEvent::Exit = event {
                let state = app.state::<TerminalState>();
                tauri::async_runtime::block_on(state.registry().shutdown());
            }
        })
        .build()
}
