#![allow(dead_code)]

use agent_terminals::{
    ProcessBackend, ProcessExit, ProcessHandle, ProcessObserver, SessionEnded, SpawnRequest,
    TerminalError, TerminalSize, TerminalView, ViewId, ViewReady,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct FakeProcess {
    observer: Arc<dyn ProcessObserver>,
    killed: bool,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    spawns: Vec<SpawnRequest>,
    processes: HashMap<ProcessHandle, FakeProcess>,
    handles: Vec<ProcessHandle>,
    writes: Vec<(ProcessHandle, Vec<u8>)>,
    resizes: Vec<(ProcessHandle, TerminalSize)>,
    kills: Vec<ProcessHandle>,
    spawn_failures: VecDeque<String>,
    fail_writes: bool,
    fail_resizes: bool,
}

/// Scripted process backend. Spawns and resizes can be held open with a
/// gate so tests can interleave calls deterministically.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    spawn_gate: Option<Semaphore>,
    resize_gate: Option<Semaphore>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every spawn waits for `release_spawns`.
    pub fn gated_spawns() -> Arc<Self> {
        Arc::new(Self {
            spawn_gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    /// Every resize waits for `release_resizes`.
    pub fn gated_resizes() -> Arc<Self> {
        Arc::new(Self {
            resize_gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn release_spawns(&self, n: usize) {
        if let Some(gate) = &self.spawn_gate {
            gate.add_permits(n);
        }
    }

    pub fn release_resizes(&self, n: usize) {
        if let Some(gate) = &self.resize_gate {
            gate.add_permits(n);
        }
    }

    pub fn fail_next_spawn(&self, reason: &str) {
        self.state.lock().spawn_failures.push_back(reason.to_string());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn fail_resizes(&self, fail: bool) {
        self.state.lock().fail_resizes = fail;
    }

    pub fn emit_output(&self, handle: ProcessHandle, chunk: &[u8]) {
        let observer = self.observer(handle);
        observer.on_output(handle, chunk.to_vec());
    }

    pub fn emit_exit(&self, handle: ProcessHandle, code: u32) {
        let observer = self.observer(handle);
        observer.on_exit(handle, ProcessExit::with_code(code));
    }

    fn observer(&self, handle: ProcessHandle) -> Arc<dyn ProcessObserver> {
        self.state
            .lock()
            .processes
            .get(&handle)
            .expect("process exists")
            .observer
            .clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().spawns.len()
    }

    pub fn spawns(&self) -> Vec<SpawnRequest> {
        self.state.lock().spawns.clone()
    }

    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.state.lock().handles.clone()
    }

    pub fn last_handle(&self) -> ProcessHandle {
        *self.state.lock().handles.last().expect("a process was spawned")
    }

    pub fn writes(&self) -> Vec<(ProcessHandle, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    pub fn resizes(&self) -> Vec<(ProcessHandle, TerminalSize)> {
        self.state.lock().resizes.clone()
    }

    pub fn kills(&self) -> Vec<ProcessHandle> {
        self.state.lock().kills.clone()
    }

    pub fn is_killed(&self, handle: ProcessHandle) -> bool {
        self.state
            .lock()
            .processes
            .get(&handle)
            .is_some_and(|p| p.killed)
    }
}

#[async_trait]
impl ProcessBackend for FakeBackend {
    async fn spawn(
        &self,
        request: SpawnRequest,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<ProcessHandle, TerminalError> {
        self.state.lock().spawns.push(request);
        if let Some(gate) = &self.spawn_gate {
            gate.acquire().await.expect("spawn gate open").forget();
        }

        let mut state = self.state.lock();
        if let Some(reason) = state.spawn_failures.pop_front() {
            return Err(TerminalError::BackendUnavailable(reason));
        }
        state.next_handle += 1;
        let handle = ProcessHandle::new(state.next_handle);
        state.processes.insert(
            handle,
            FakeProcess {
                observer,
                killed: false,
            },
        );
        state.handles.push(handle);
        Ok(handle)
    }

    async fn write(&self, handle: ProcessHandle, bytes: &[u8]) -> Result<(), TerminalError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(TerminalError::WriteFailed("broken pipe".to_string()));
        }
        match state.processes.get(&handle) {
            Some(process) if !process.killed => {
                state.writes.push((handle, bytes.to_vec()));
                Ok(())
            }
            _ => Err(TerminalError::WriteFailed(format!("{handle} is gone"))),
        }
    }

    async fn resize(&self, handle: ProcessHandle, size: TerminalSize) -> Result<(), TerminalError> {
        self.state.lock().resizes.push((handle, size));
        if let Some(gate) = &self.resize_gate {
            gate.acquire().await.expect("resize gate open").forget();
        }
        if self.state.lock().fail_resizes {
            return Err(TerminalError::ResizeFailed("ioctl failed".to_string()));
        }
        Ok(())
    }

    async fn kill(&self, handle: ProcessHandle) -> Result<(), TerminalError> {
        let mut state = self.state.lock();
        state.kills.push(handle);
        if let Some(process) = state.processes.get_mut(&handle) {
            process.killed = true;
        }
        Ok(())
    }
}

/// Terminal widget double that records everything it is shown.
pub struct RecordingView {
    id: ViewId,
    output: Mutex<Vec<Vec<u8>>>,
    ends: Mutex<Vec<SessionEnded>>,
    readies: Mutex<Vec<ViewReady>>,
    disposed: Mutex<usize>,
    fit_script: Mutex<VecDeque<Option<TerminalSize>>>,
    fit_fallback: Mutex<Option<TerminalSize>>,
    fit_calls: Mutex<usize>,
    ready_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl RecordingView {
    pub fn new(id: &str) -> Arc<Self> {
        Self::sized(id, None)
    }

    pub fn sized(id: &str, size: Option<TerminalSize>) -> Arc<Self> {
        Arc::new(Self {
            id: ViewId::new(id),
            output: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
            readies: Mutex::new(Vec::new()),
            disposed: Mutex::new(0),
            fit_script: Mutex::new(VecDeque::new()),
            fit_fallback: Mutex::new(size),
            fit_calls: Mutex::new(0),
            ready_hook: Mutex::new(None),
        })
    }

    /// Queues answers for successive `fit` calls before the fallback size
    /// applies.
    pub fn script_fits(&self, fits: impl IntoIterator<Item = Option<TerminalSize>>) {
        self.fit_script.lock().extend(fits);
    }

    /// Runs `hook` from inside `on_ready`, i.e. between acquiring the
    /// session and replaying its history.
    pub fn on_ready_run(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.ready_hook.lock() = Some(Box::new(hook));
    }

    pub fn set_size(&self, size: Option<TerminalSize>) {
        *self.fit_fallback.lock() = size;
    }

    pub fn output(&self) -> Vec<Vec<u8>> {
        self.output.lock().clone()
    }

    pub fn output_text(&self) -> Vec<String> {
        self.output()
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }

    pub fn ends(&self) -> Vec<SessionEnded> {
        self.ends.lock().clone()
    }

    pub fn readies(&self) -> Vec<ViewReady> {
        self.readies.lock().clone()
    }

    pub fn disposed(&self) -> usize {
        *self.disposed.lock()
    }

    pub fn fit_calls(&self) -> usize {
        *self.fit_calls.lock()
    }
}

impl TerminalView for RecordingView {
    fn id(&self) -> &ViewId {
        &self.id
    }

    fn on_output(&self, chunk: &[u8]) {
        self.output.lock().push(chunk.to_vec());
    }

    fn on_session_end(&self, ended: &SessionEnded) {
        self.ends.lock().push(ended.clone());
    }

    fn on_ready(&self, ready: &ViewReady) {
        self.readies.lock().push(ready.clone());
        if let Some(hook) = self.ready_hook.lock().as_ref() {
            hook();
        }
    }

    fn fit(&self) -> Option<TerminalSize> {
        *self.fit_calls.lock() += 1;
        match self.fit_script.lock().pop_front() {
            Some(scripted) => scripted,
            None => *self.fit_fallback.lock(),
        }
    }

    fn dispose(&self) {
        *self.disposed.lock() += 1;
    }
}

/// Polls `condition` until it holds, yielding to other tasks in between.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached before timeout");
}
