use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{ProcessBackend, ProcessExit, ProcessHandle, ProcessObserver, SpawnRequest};
use crate::config::TerminalConfig;
use crate::error::{Result, TerminalError};
use crate::session::TerminalSize;
use crate::shell;

const READ_CHUNK: usize = 4096;

/// Handles used from async callers. The child itself is owned by the reader
/// thread, which blocks in `wait`; kills go through a cloned killer.
struct PtyProcess {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Arc<Mutex<Box<dyn ChildKiller + Send + Sync>>>,
}

type Opened = (PtyProcess, Box<dyn Read + Send>, Box<dyn Child + Send + Sync>);

/// Process backend over the host's native pseudo-terminal.
pub struct PortablePtyBackend {
    config: TerminalConfig,
    next_handle: AtomicU64,
    processes: Arc<Mutex<HashMap<ProcessHandle, PtyProcess>>>,
}

impl PortablePtyBackend {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn command_for(&self, request: &SpawnRequest) -> CommandBuilder {
        let mut cmd = match &request.command {
            Some(spec) => {
                let mut cmd = CommandBuilder::new(&spec.program);
                cmd.args(&spec.args);
                cmd
            }
            None => CommandBuilder::new(shell::default_shell(self.config.shell.as_deref())),
        };
        cmd.cwd(&request.cwd);

        if !cfg!(windows) {
            cmd.env("TERM", &self.config.term);
            cmd.env("COLORTERM", "truecolor");
        }
        if let Some(path) = shell::login_path() {
            cmd.env("PATH", path);
        }
        for name in &self.config.strip_env {
            cmd.env_remove(name);
        }
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        cmd
    }

    fn open(&self, request: &SpawnRequest) -> Result<Opened> {
        let pair = native_pty_system()
            .openpty(pty_size(request.size))
            .map_err(|e| TerminalError::BackendUnavailable(format!("openpty: {e}")))?;

        let child = pair
            .slave
            .spawn_command(self.command_for(request))
            .map_err(|e| TerminalError::BackendUnavailable(e.to_string()))?;

        // Only the master side is needed once the child holds the slave.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Pty(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Pty(e.to_string()))?;

        Ok((
            PtyProcess {
                master: Arc::new(Mutex::new(pair.master)),
                writer: Arc::new(Mutex::new(writer)),
                killer: Arc::new(Mutex::new(child.clone_killer())),
            },
            reader,
            child,
        ))
    }

    fn process_parts<T>(
        &self,
        handle: ProcessHandle,
        pick: impl FnOnce(&PtyProcess) -> Arc<Mutex<T>>,
    ) -> Result<Arc<Mutex<T>>>
    where
        T: ?Sized,
    {
        self.processes
            .lock()
            .get(&handle)
            .map(pick)
            .ok_or_else(|| TerminalError::SessionNotFound(handle.to_string()))
    }
}

#[async_trait]
impl ProcessBackend for PortablePtyBackend {
    async fn spawn(
        &self,
        request: SpawnRequest,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<ProcessHandle> {
        info!(key = %request.key, cwd = %request.cwd.display(), size = %request.size, "Spawning PTY");

        let (process, mut reader, mut child) = self.open(&request).map_err(|e| {
            error!(key = %request.key, err = %e, "Failed to spawn PTY");
            e
        })?;

        let handle = ProcessHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.processes.lock().insert(handle, process);

        let processes = self.processes.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{}", handle.raw()))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => observer.on_output(handle, buf[..n].to_vec()),
                        Err(e) => {
                            debug!(handle = %handle, err = %e, "PTY read ended");
                            break;
                        }
                    }
                }
                let exit_code = child.wait().ok().map(|status| status.exit_code());
                processes.lock().remove(&handle);
                observer.on_exit(handle, ProcessExit { exit_code });
            });

        if let Err(e) = spawned {
            if let Some(process) = self.processes.lock().remove(&handle) {
                let _ = process.killer.lock().kill();
            }
            return Err(TerminalError::Pty(e.to_string()));
        }

        Ok(handle)
    }

    async fn write(&self, handle: ProcessHandle, bytes: &[u8]) -> Result<()> {
        let writer = self.process_parts(handle, |p| p.writer.clone())?;
        let bytes = bytes.to_vec();
        blocking(move || {
            let mut writer = writer.lock();
            writer.write_all(&bytes)?;
            writer.flush()
        })
        .await?
        .map_err(|e| TerminalError::WriteFailed(e.to_string()))
    }

    async fn resize(&self, handle: ProcessHandle, size: TerminalSize) -> Result<()> {
        let master = self.process_parts(handle, |p| p.master.clone())?;
        blocking(move || master.lock().resize(pty_size(size)))
            .await?
            .map_err(|e| TerminalError::ResizeFailed(e.to_string()))
    }

    async fn kill(&self, handle: ProcessHandle) -> Result<()> {
        let Some(process) = self.processes.lock().remove(&handle) else {
            return Ok(());
        };
        info!(handle = %handle, "Killing PTY process");
        let killer = process.killer.clone();
        // Master and writer close with `process`; the reader thread then
        // reaps the child.
        let killed = blocking(move || killer.lock().kill()).await?;
        drop(process);
        if let Err(e) = killed {
            // Already reaped processes report an error here.
            warn!(handle = %handle, err = %e, "Failed to kill PTY process");
        }
        Ok(())
    }
}

/// Runs PTY I/O off the async worker threads.
async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| TerminalError::Pty(format!("blocking PTY task failed: {e}")))
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
