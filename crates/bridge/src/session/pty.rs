//! PTY session management.
//!
//! This module provides the core PTY spawning and I/O functionality. A
//! session owns one interactive shell on a pseudo-terminal. Blocking PTY
//! handles live on dedicated threads; an async pump task turns their output
//! into session-tagged events and reports the exit exactly once.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::messages::{PtyData, PtyExit, SpawnTerminal};
use protocol::{Event, SessionId};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::registry::{Instance, ProcessKind, SessionRegistry, Supervised};
use super::resize::ResizeApplier;
use super::{SessionError, TerminalManager};
use crate::config::TerminalConfig;
use crate::events::EventRouter;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Exit code reported when the shell's status cannot be collected.
const UNKNOWN_EXIT_CODE: i32 = -1;

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const EXITED: u8 = 2;

struct WriteRequest {
    data: Bytes,
    ack: oneshot::Sender<std::io::Result<()>>,
}

struct MasterState {
    pty: Box<dyn MasterPty + Send>,
    cols: u16,
    rows: u16,
}

/// Everything produced by opening a PTY and launching the shell.
struct OpenedPty {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    input: mpsc::UnboundedSender<WriteRequest>,
    output: mpsc::UnboundedReceiver<Bytes>,
    exit: oneshot::Receiver<i32>,
}

/// A PTY session with a shell process.
///
/// Writes are accepted only while the session is running. Once a kill has
/// been requested or the shell has exited, further writes fail with
/// [`SessionError::NotFound`].
pub struct PtySession {
    id: SessionId,
    instance: Instance,
    pid: Option<u32>,
    state: AtomicU8,
    master: Mutex<MasterState>,
    input: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    done: watch::Receiver<bool>,
}

impl PtySession {
    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the registry instance this session was installed as.
    pub fn instance(&self) -> Instance {
        self.instance
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the session still accepts input.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Returns the current terminal size as `(cols, rows)`.
    pub async fn size(&self) -> (u16, u16) {
        let master = self.master.lock().await;
        (master.cols, master.rows)
    }

    /// Writes data to the shell's input verbatim.
    ///
    /// Resolves once the bytes have been handed to the OS.
    pub async fn write(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotFound(self.id.clone()));
        }

        let input = self
            .input
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::NotFound(self.id.clone()))?;

        let (ack, ack_rx) = oneshot::channel();
        input
            .send(WriteRequest { data, ack })
            .map_err(|_| SessionError::InputClosed(self.id.clone()))?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::WriteFailed {
                id: self.id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(SessionError::InputClosed(self.id.clone())),
        }
    }

    /// Resizes the PTY. Returns false if the size was already current.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<bool, SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotFound(self.id.clone()));
        }

        let mut master = self.master.lock().await;
        if master.cols == cols && master.rows == rows {
            return Ok(false);
        }

        master
            .pty
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        master.cols = cols;
        master.rows = rows;

        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");
        Ok(true)
    }

    /// Terminates the shell and waits until its exit has been reported.
    ///
    /// The input stream is closed first, then the shell is sent SIGHUP. If it
    /// is still alive after `grace` it gets SIGKILL, and if that is not
    /// confirmed within another `grace` the call fails.
    pub async fn kill(&self, grace: Duration) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Ok(());
        }

        let _ = self
            .state
            .compare_exchange(RUNNING, CLOSING, Ordering::SeqCst, Ordering::SeqCst);
        self.input.lock().await.take();

        if let Err(e) = self.killer.lock().await.kill() {
            tracing::debug!(session_id = %self.id, error = %e, "Hangup signal failed");
        }
        if self.wait_done(grace).await {
            return Ok(());
        }

        tracing::warn!(session_id = %self.id, "Shell ignored hangup, sending SIGKILL");
        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::debug!(session_id = %self.id, error = %e, "SIGKILL failed");
            }
        }
        if self.wait_done(grace).await {
            return Ok(());
        }

        tracing::error!(session_id = %self.id, "Shell did not terminate");
        Err(SessionError::TerminationTimeout(self.id.clone()))
    }

    async fn wait_done(&self, grace: Duration) -> bool {
        let mut done = self.done.clone();
        let confirmed = tokio::time::timeout(grace, done.wait_for(|done| *done))
            .await
            .is_ok();
        confirmed
    }

    fn emit(&self, events: &EventRouter, event: Event) {
        events.publish(ProcessKind::Terminal, self.instance, event);
    }
}

impl Supervised for PtySession {
    fn is_terminated(&self) -> bool {
        self.state.load(Ordering::SeqCst) == EXITED
    }
}

/// Opens a PTY, launches the shell and starts the blocking I/O threads.
fn open_pty(
    request: &SpawnTerminal,
    shell: &str,
    config: &TerminalConfig,
) -> Result<OpenedPty, SessionError> {
    let id = request.session_id.as_str();

    let mut cmd = CommandBuilder::new(shell);
    if config.login_shell {
        cmd.arg("-l");
    }
    if let Some(dir) = request.cwd.as_deref().filter(|d| !d.is_empty()) {
        if !Path::new(dir).is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {}",
                dir
            )));
        }
        cmd.cwd(dir);
    }
    cmd.env("TERM", &config.term);
    cmd.env("COLORTERM", &config.colorterm);
    cmd.env("SHELL", shell);

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", shell, e)))?;
    // The master must see EOF once the shell exits.
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();

    let handles = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    let (reader, writer) = match handles {
        Ok(handles) => handles,
        Err(e) => {
            let _ = child.kill();
            return Err(SessionError::SpawnFailed(e.to_string()));
        }
    };

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();

    let threads = spawn_thread(format!("pty-write-{}", id), move || {
        write_loop(writer, input_rx)
    })
    .and_then(|_| spawn_thread(format!("pty-read-{}", id), move || read_loop(reader, output_tx)))
    .and_then(|_| {
        let session_id = id.to_string();
        spawn_thread(format!("pty-wait-{}", id), move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to collect shell status");
                    UNKNOWN_EXIT_CODE
                }
            };
            let _ = exit_tx.send(code);
        })
    });
    if let Err(e) = threads {
        let mut killer = killer;
        let _ = killer.kill();
        return Err(SessionError::SpawnFailed(e.to_string()));
    }

    Ok(OpenedPty {
        master: pair.master,
        killer,
        pid,
        input: input_tx,
        output: output_rx,
        exit: exit_rx,
    })
}

fn spawn_thread<F>(name: String, f: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(f).map(|_| ())
}

fn write_loop(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<WriteRequest>,
) {
    while let Some(request) = input.blocking_recv() {
        let result = writer
            .write_all(&request.data)
            .and_then(|_| writer.flush());
        let _ = request.ack.send(result);
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, output: mpsc::UnboundedSender<Bytes>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if output.send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone.
            Err(_) => break,
        }
    }
}

/// Forwards output in production order, then reports the exit once.
async fn pump(
    session: Arc<PtySession>,
    mut output: mpsc::UnboundedReceiver<Bytes>,
    mut exit: oneshot::Receiver<i32>,
    done: watch::Sender<bool>,
    events: Arc<EventRouter>,
    registry: Arc<SessionRegistry>,
    exit_drain: Duration,
) {
    let exit_code = loop {
        tokio::select! {
            biased;
            chunk = output.recv() => match chunk {
                Some(data) => emit_data(&session, &events, data),
                None => break (&mut exit).await.unwrap_or(UNKNOWN_EXIT_CODE),
            },
            code = &mut exit => {
                // Background jobs may keep the slave open; bound the drain.
                let deadline = tokio::time::Instant::now() + exit_drain;
                while let Ok(Some(data)) = tokio::time::timeout_at(deadline, output.recv()).await {
                    emit_data(&session, &events, data);
                }
                break code.unwrap_or(UNKNOWN_EXIT_CODE);
            }
        }
    };

    session.state.store(EXITED, Ordering::SeqCst);
    session.input.lock().await.take();

    tracing::info!(session_id = %session.id, exit_code, "Shell exited");
    session.emit(
        &events,
        Event::PtyExit(PtyExit {
            session_id: session.id.clone(),
            exit_code,
        }),
    );
    registry.remove_terminal(&session.id, session.instance);
    let _ = done.send(true);
}

fn emit_data(session: &PtySession, events: &EventRouter, data: Bytes) {
    session.emit(
        events,
        Event::PtyData(PtyData {
            session_id: session.id.clone(),
            data,
        }),
    );
}

/// Owns the terminal side of every session.
pub struct PtyBridge {
    registry: Arc<SessionRegistry>,
    events: Arc<EventRouter>,
    config: TerminalConfig,
}

impl PtyBridge {
    /// Creates a new PTY bridge.
    pub fn new(
        registry: Arc<SessionRegistry>,
        events: Arc<EventRouter>,
        config: TerminalConfig,
    ) -> Self {
        Self {
            registry,
            events,
            config,
        }
    }

    /// Spawns a shell for the session and starts streaming its output.
    ///
    /// Fails with [`SessionError::AlreadyRunning`] if the session already has
    /// a live terminal.
    pub async fn spawn(&self, request: SpawnTerminal) -> Result<(), SessionError> {
        let session_id = request.session_id.clone();
        let instance = self.registry.reserve(&session_id, ProcessKind::Terminal)?;

        let shell = self.config.resolve_shell(request.shell.as_deref());
        let config = self.config.clone();
        let launch_shell = shell.clone();
        let (cols, rows) = (request.cols, request.rows);
        let opened = tokio::task::spawn_blocking(move || open_pty(&request, &launch_shell, &config))
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
            .and_then(|result| result);

        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.registry
                    .release(&session_id, ProcessKind::Terminal, instance);
                tracing::warn!(session_id = %session_id, error = %e, "Failed to spawn terminal");
                return Err(e);
            }
        };

        let (done_tx, done_rx) = watch::channel(false);
        let session = Arc::new(PtySession {
            id: session_id.clone(),
            instance,
            pid: opened.pid,
            state: AtomicU8::new(RUNNING),
            master: Mutex::new(MasterState {
                pty: opened.master,
                cols,
                rows,
            }),
            input: Mutex::new(Some(opened.input)),
            killer: Mutex::new(opened.killer),
            done: done_rx,
        });

        let installed = self
            .registry
            .install_terminal(&session_id, instance, Arc::clone(&session));

        // The pump reaps the shell either way; a stale instance's events
        // are dropped by the router.
        tokio::spawn(pump(
            Arc::clone(&session),
            opened.output,
            opened.exit,
            done_tx,
            Arc::clone(&self.events),
            Arc::clone(&self.registry),
            self.config.exit_drain(),
        ));

        if !installed {
            tracing::warn!(session_id = %session_id, "Terminal slot released during spawn");
            if let Err(e) = session.kill(self.config.kill_grace()).await {
                tracing::error!(session_id = %session_id, error = %e, "Failed to kill orphaned shell");
            }
            return Err(SessionError::SpawnFailed(format!(
                "session {} was released during spawn",
                session_id
            )));
        }

        tracing::info!(
            session_id = %session_id,
            pid = ?session.pid,
            shell = %shell,
            cols,
            rows,
            "Spawned terminal"
        );
        Ok(())
    }

    /// Forwards bytes to the session's shell.
    pub async fn write(&self, session_id: &SessionId, data: Bytes) -> Result<(), SessionError> {
        self.live(session_id)?.write(data).await
    }

    /// Resizes the session's terminal immediately.
    pub async fn resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        self.live(session_id)?.resize(cols, rows).await.map(|_| ())
    }

    /// Terminates the session's shell. Absent sessions succeed silently.
    ///
    /// A spawn already in progress for the session is waited for, so its
    /// shell is killed rather than left running.
    pub async fn kill(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.registry
            .settled(session_id, ProcessKind::Terminal)
            .await;
        match self.registry.terminal(session_id) {
            Some(session) => session.kill(self.config.kill_grace()).await,
            None => Ok(()),
        }
    }

    /// Terminates every live shell, logging failures.
    pub async fn kill_all(&self) {
        let grace = self.config.kill_grace();
        for session in self.registry.terminals() {
            if let Err(e) = session.kill(grace).await {
                tracing::error!(session_id = %session.id(), error = %e, "Failed to kill terminal");
            }
        }
    }

    /// Returns true if the session has a running shell.
    pub fn is_live(&self, session_id: &SessionId) -> bool {
        self.registry
            .terminal(session_id)
            .is_some_and(|session| session.is_running())
    }

    fn live(&self, session_id: &SessionId) -> Result<Arc<PtySession>, SessionError> {
        self.registry
            .terminal(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }
}

impl ResizeApplier for PtyBridge {
    fn is_live(&self, session_id: &SessionId) -> bool {
        PtyBridge::is_live(self, session_id)
    }

    async fn apply_resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        self.resize(session_id, cols, rows).await
    }
}

impl TerminalManager for PtyBridge {
    async fn spawn(&self, request: SpawnTerminal) -> Result<(), SessionError> {
        PtyBridge::spawn(self, request).await
    }

    async fn write(&self, session_id: &SessionId, data: Bytes) -> Result<(), SessionError> {
        PtyBridge::write(self, session_id, data).await
    }

    async fn kill(&self, session_id: &SessionId) -> Result<(), SessionError> {
        PtyBridge::kill(self, session_id).await
    }

    async fn kill_all(&self) {
        PtyBridge::kill_all(self).await
    }
}
