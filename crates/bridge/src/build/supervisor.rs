//! Build server processes.
//!
//! A build server runs in its own process group so that a stop reaches the
//! workers it forks. Two reader tasks classify its stdout and stderr lines,
//! and a waiter task reaps it, reports an unexpected exit and frees the
//! registry slot.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use protocol::messages::{
    BuildFailure, BuildRebuilt, BuildStarted, BuildStatusInfo, BuildTerminated, StartBuild,
};
use protocol::{Event, SessionId};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::output::{clean_line, OutputClassifier, OutputLine};
use super::{BuildError, BuildManager};
use crate::config::BuildConfig;
use crate::events::EventRouter;
use crate::session::{Instance, ProcessKind, SessionError, SessionRegistry, Supervised};

/// Output lines kept for startup failure reports.
const TAIL_LINES: usize = 20;

/// How long the waiter waits for the output readers after the exit.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

const BIND_FAILURE: &str = "address already in use";

#[derive(Debug)]
struct BuildState {
    port: Option<u16>,
    running: bool,
    last_error: Option<String>,
    /// True until `start` has reported its outcome.
    starting: bool,
    /// Set once the process is reaped; the inner value is its exit code.
    exit: Option<Option<i32>>,
    tail: VecDeque<String>,
}

/// One live build server.
pub struct BuildSession {
    id: SessionId,
    instance: Instance,
    pid: Option<u32>,
    requested_port: u16,
    classifier: OutputClassifier,
    state: Mutex<BuildState>,
    stopping: AtomicBool,
    exited: AtomicBool,
    port: watch::Sender<Option<u16>>,
    done: watch::Receiver<bool>,
}

impl BuildSession {
    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the registry instance this build was installed as.
    pub fn instance(&self) -> Instance {
        self.instance
    }

    /// Returns the process (and process group) ID.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the announced port.
    pub fn port(&self) -> Option<u16> {
        self.lock().port
    }

    /// Returns a snapshot for status queries.
    pub fn status(&self) -> BuildStatusInfo {
        let state = self.lock();
        BuildStatusInfo {
            port: state.port,
            running: state.running,
            last_error: state.last_error.clone(),
        }
    }

    /// Returns the most recent cleaned output lines, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        self.lock().tail.iter().cloned().collect()
    }

    /// Stops the build server and waits until it has been reaped.
    ///
    /// The process group gets SIGTERM, then SIGKILL once `grace` has passed.
    /// If the exit is still not confirmed after another `grace` the call
    /// fails.
    pub async fn stop(&self, grace: Duration) -> Result<(), BuildError> {
        if self.is_terminated() {
            return Ok(());
        }
        self.stopping.store(true, Ordering::SeqCst);

        self.signal_group(Signal::SIGTERM);
        if self.wait_done(grace).await {
            return Ok(());
        }

        tracing::warn!(session_id = %self.id, "Build server ignored SIGTERM, sending SIGKILL");
        self.signal_group(Signal::SIGKILL);
        if self.wait_done(grace).await {
            return Ok(());
        }

        tracing::error!(session_id = %self.id, "Build server did not terminate");
        Err(BuildError::TerminationTimeout(self.id.clone()))
    }

    fn signal_group(&self, sig: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(e) = signal::killpg(Pid::from_raw(pid as i32), sig) {
            tracing::debug!(session_id = %self.id, signal = ?sig, error = %e, "Signal failed");
        }
    }

    async fn wait_done(&self, grace: Duration) -> bool {
        let mut done = self.done.clone();
        let confirmed = tokio::time::timeout(grace, done.wait_for(|done| *done))
            .await
            .is_ok();
        confirmed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: &EventRouter, event: Event) {
        events.publish(ProcessKind::Build, self.instance, event);
    }

    fn handle_line(&self, events: &EventRouter, raw: &str) {
        let line = clean_line(raw);
        let kind = self.classifier.classify_clean(&line);
        if !line.is_empty() {
            tracing::trace!(session_id = %self.id, line = %line, "Build output");
            let mut state = self.lock();
            if state.tail.len() == TAIL_LINES {
                state.tail.pop_front();
            }
            state.tail.push_back(line);
        }

        match kind {
            OutputLine::Serving(port) => {
                let first = {
                    let mut state = self.lock();
                    if state.port.is_none() {
                        state.port = Some(port);
                        true
                    } else {
                        false
                    }
                };
                if first {
                    tracing::info!(session_id = %self.id, port, "Build server is serving");
                    self.port.send_replace(Some(port));
                    self.emit(
                        events,
                        Event::BuildStarted(BuildStarted {
                            session_id: self.id.clone(),
                            port,
                        }),
                    );
                }
            }
            OutputLine::Rebuilt => {
                self.lock().last_error = None;
                tracing::debug!(session_id = %self.id, "Documentation rebuilt");
                self.emit(
                    events,
                    Event::BuildRebuilt(BuildRebuilt {
                        session_id: self.id.clone(),
                    }),
                );
            }
            OutputLine::Failed(message) => {
                self.lock().last_error = Some(message.clone());
                tracing::debug!(session_id = %self.id, message = %message, "Documentation build failed");
                self.emit(
                    events,
                    Event::BuildError(BuildFailure {
                        session_id: self.id.clone(),
                        message,
                    }),
                );
            }
            OutputLine::Other => {}
        }
    }

    /// Records the exit. Returns true if it must be reported as unexpected.
    fn mark_exited(&self, code: Option<i32>) -> bool {
        let mut state = self.lock();
        state.running = false;
        state.exit = Some(code);
        self.exited.store(true, Ordering::SeqCst);
        // A failed startup is reported by `start` itself.
        !self.stopping.load(Ordering::SeqCst) && (state.port.is_some() || !state.starting)
    }

    /// Ends the startup phase and returns what it produced.
    fn finish_startup(&self) -> (Option<u16>, Option<Option<i32>>, Vec<String>) {
        let mut state = self.lock();
        state.starting = false;
        (state.port, state.exit, state.tail.iter().cloned().collect())
    }

    fn startup_failure(&self, code: Option<i32>, tail: Vec<String>) -> BuildError {
        if let Some(line) = tail
            .iter()
            .rev()
            .find(|line| line.to_ascii_lowercase().contains(BIND_FAILURE))
        {
            return BuildError::PortBindFailure {
                id: self.id.clone(),
                port: self.requested_port,
                message: line.clone(),
            };
        }

        let status = match code {
            Some(code) => format!("exit code {}", code),
            None => "a signal".to_string(),
        };
        let mut message = format!("build server exited with {} before announcing a port", status);
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(&tail.join("\n"));
        }
        BuildError::SpawnFailed(message)
    }
}

impl Supervised for BuildSession {
    fn is_terminated(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

fn launch(request: &StartBuild, config: &BuildConfig) -> Result<Child, BuildError> {
    let project = Path::new(&request.project_path);
    if !project.is_dir() {
        return Err(BuildError::SpawnFailed(format!(
            "project directory does not exist: {}",
            request.project_path
        )));
    }

    let mut cmd = Command::new(&request.interpreter_path);
    cmd.arg("-m")
        .arg(&config.module)
        .arg(project.join(&request.source_dir))
        .arg(project.join(&request.build_dir))
        .arg("--port")
        .arg(request.port.to_string())
        .arg("--host")
        .arg(&config.host)
        .args(&request.extra_args)
        .current_dir(project)
        // Piped output must not sit in the interpreter's buffers.
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    cmd.spawn()
        .map_err(|e| BuildError::SpawnFailed(format!("{}: {}", request.interpreter_path, e)))
}

async fn read_output<R>(
    session: Arc<BuildSession>,
    events: Arc<EventRouter>,
    stream: R,
    source: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => session.handle_line(&events, &String::from_utf8_lossy(&buf)),
            Err(e) => {
                tracing::debug!(session_id = %session.id, stream = source, error = %e, "Build output read failed");
                break;
            }
        }
    }
}

/// Reaps the process, reports an unexpected exit and frees the slot.
async fn supervise(
    session: Arc<BuildSession>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    done: watch::Sender<bool>,
    events: Arc<EventRouter>,
    registry: Arc<SessionRegistry>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to collect build server status");
            None
        }
    };

    // Forked workers may hold the pipes open past the exit.
    for mut reader in readers {
        if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }

    let unexpected = session.mark_exited(code);
    if unexpected {
        tracing::warn!(session_id = %session.id, exit_code = ?code, "Build server terminated");
        session.emit(
            &events,
            Event::BuildTerminated(BuildTerminated {
                session_id: session.id.clone(),
                exit_code: code,
            }),
        );
    } else {
        tracing::info!(session_id = %session.id, exit_code = ?code, "Build server exited");
    }

    registry.remove_build(&session.id, session.instance);
    let _ = done.send(true);
}

/// Owns the build side of every session.
pub struct BuildSupervisor {
    registry: Arc<SessionRegistry>,
    events: Arc<EventRouter>,
    config: BuildConfig,
    classifier: OutputClassifier,
}

impl BuildSupervisor {
    /// Creates a new build supervisor.
    pub fn new(registry: Arc<SessionRegistry>, events: Arc<EventRouter>, config: BuildConfig) -> Self {
        let classifier = OutputClassifier::from_config(&config);
        Self {
            registry,
            events,
            config,
            classifier,
        }
    }

    /// Launches the session's build server and waits for its port.
    ///
    /// Returns `Ok(None)` if the server is alive but has not announced a
    /// port within the startup timeout; `build_started` follows once it
    /// does.
    pub async fn start(&self, request: StartBuild) -> Result<Option<u16>, BuildError> {
        let session_id = request.session_id.clone();
        let instance = self
            .registry
            .reserve(&session_id, ProcessKind::Build)
            .map_err(|e| match e {
                SessionError::AlreadyRunning { id, .. } => BuildError::AlreadyRunning(id),
                other => BuildError::SpawnFailed(other.to_string()),
            })?;

        let mut child = match launch(&request, &self.config) {
            Ok(child) => child,
            Err(e) => {
                self.registry.release(&session_id, ProcessKind::Build, instance);
                tracing::warn!(session_id = %session_id, error = %e, "Failed to launch build server");
                return Err(e);
            }
        };

        let (done_tx, done_rx) = watch::channel(false);
        let (port_tx, mut port_rx) = watch::channel(None);
        let session = Arc::new(BuildSession {
            id: session_id.clone(),
            instance,
            pid: child.id(),
            requested_port: request.port,
            classifier: self.classifier.clone(),
            state: Mutex::new(BuildState {
                port: None,
                running: true,
                last_error: None,
                starting: true,
                exit: None,
                tail: VecDeque::with_capacity(TAIL_LINES),
            }),
            stopping: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            port: port_tx,
            done: done_rx,
        });

        if !self
            .registry
            .install_build(&session_id, instance, Arc::clone(&session))
        {
            let _ = child.start_kill();
            return Err(BuildError::SpawnFailed(format!(
                "session {} was released during start",
                session_id
            )));
        }

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_output(
                Arc::clone(&session),
                Arc::clone(&self.events),
                stdout,
                "stdout",
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_output(
                Arc::clone(&session),
                Arc::clone(&self.events),
                stderr,
                "stderr",
            )));
        }
        tokio::spawn(supervise(
            Arc::clone(&session),
            child,
            readers,
            done_tx,
            Arc::clone(&self.events),
            Arc::clone(&self.registry),
        ));

        tracing::info!(
            session_id = %session_id,
            pid = ?session.pid,
            project = %request.project_path,
            port = request.port,
            "Launched build server"
        );

        let mut done = session.done.clone();
        let _ = tokio::time::timeout(self.config.startup_timeout(), async {
            loop {
                if port_rx.borrow_and_update().is_some() || *done.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    changed = port_rx.changed() => if changed.is_err() { break },
                    changed = done.changed() => if changed.is_err() { break },
                }
            }
        })
        .await;

        match session.finish_startup() {
            (Some(port), _, _) => Ok(Some(port)),
            (None, Some(code), tail) => {
                let error = session.startup_failure(code, tail);
                tracing::warn!(session_id = %session_id, error = %error, "Build server failed to start");
                Err(error)
            }
            (None, None, _) => {
                tracing::info!(session_id = %session_id, "Build server has not announced a port yet");
                Ok(None)
            }
        }
    }

    /// Stops the session's build server. Absent builds succeed silently.
    ///
    /// A launch already in progress is waited for, then stopped.
    pub async fn stop(&self, session_id: &SessionId) -> Result<(), BuildError> {
        self.registry.settled(session_id, ProcessKind::Build).await;
        match self.registry.build(session_id) {
            Some(session) => session.stop(self.config.stop_grace()).await,
            None => Ok(()),
        }
    }

    /// Returns a status snapshot of the session's build server.
    pub fn status(&self, session_id: &SessionId) -> Option<BuildStatusInfo> {
        self.registry.build(session_id).map(|session| session.status())
    }

    /// Stops every build server, logging failures.
    pub async fn stop_all(&self) {
        let grace = self.config.stop_grace();
        for session in self.registry.builds() {
            if let Err(e) = session.stop(grace).await {
                tracing::error!(session_id = %session.id(), error = %e, "Failed to stop build server");
            }
        }
    }
}

impl Drop for BuildSupervisor {
    fn drop(&mut self) {
        for session in self.registry.builds() {
            if !session.is_terminated() {
                session.stopping.store(true, Ordering::SeqCst);
                session.signal_group(Signal::SIGKILL);
            }
        }
    }
}

impl BuildManager for BuildSupervisor {
    async fn start(&self, request: StartBuild) -> Result<Option<u16>, BuildError> {
        BuildSupervisor::start(self, request).await
    }

    async fn stop(&self, session_id: &SessionId) -> Result<(), BuildError> {
        BuildSupervisor::stop(self, session_id).await
    }

    fn status(&self, session_id: &SessionId) -> Option<BuildStatusInfo> {
        BuildSupervisor::status(self, session_id)
    }

    async fn stop_all(&self) {
        BuildSupervisor::stop_all(self).await
    }
}
