//! Command router for dispatching front-end commands to the owning subsystem.
//!
//! This module provides the `CommandRouter` struct that receives protocol
//! commands and routes them to the terminal manager, the resize coalescer or
//! the build manager based on command type. Every command produces exactly
//! one response; failures become protocol error payloads.

use std::sync::Arc;
use std::time::Duration;

use protocol::messages::{
    BuildStatusRequest, DetachSession, KillTerminal, PtyResize, PtyWrite, SpawnTerminal,
    StartBuild, StopBuild,
};
use protocol::{Command, ErrorCode, ErrorMessage, Response, SessionId};
use tracing::{debug, info, warn};

use crate::build::{BuildError, BuildManager};
use crate::session::{ResizeCoalescer, SessionError, SessionRegistry, TerminalManager};

/// Result type for router operations.
pub type RouterResult = Result<Response, RouterError>;

/// Errors that can occur during command routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Terminal or registry error.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Build supervision error.
    #[error("{0}")]
    Build(#[from] BuildError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Returns the protocol error code and whether the caller may retry.
    pub fn code(&self) -> (ErrorCode, bool) {
        match self {
            RouterError::Session(e) => match e {
                SessionError::NotFound(_) => (ErrorCode::NotFound, true),
                SessionError::AlreadyRunning { .. } => (ErrorCode::AlreadyRunning, true),
                SessionError::SpawnFailed(_) => (ErrorCode::SpawnError, false),
                SessionError::InputClosed(_)
                | SessionError::WriteFailed { .. }
                | SessionError::ResizeFailed(_) => (ErrorCode::IoError, true),
                SessionError::TerminationTimeout(_) => (ErrorCode::TerminationTimeout, false),
            },
            RouterError::Build(e) => match e {
                BuildError::AlreadyRunning(_) => (ErrorCode::AlreadyRunning, true),
                BuildError::SpawnFailed(_) => (ErrorCode::SpawnError, false),
                BuildError::PortBindFailure { .. } => (ErrorCode::PortBindFailure, true),
                BuildError::TerminationTimeout(_) => (ErrorCode::TerminationTimeout, false),
            },
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
            RouterError::Internal(_) => (ErrorCode::Internal, true),
        }
    }

    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self, session_id: Option<SessionId>) -> ErrorMessage {
        let (code, recoverable) = self.code();
        ErrorMessage {
            code,
            message: self.to_string(),
            session_id,
            recoverable,
        }
    }
}

/// Command router that dispatches commands to the terminal and build
/// managers.
///
/// Resizes go through a per-session coalescer; everything else is forwarded
/// directly. The router keeps no per-command state, so commands for
/// different sessions can be routed concurrently.
pub struct CommandRouter<T: TerminalManager, B: BuildManager> {
    /// Terminal manager for PTY operations.
    terminals: Arc<T>,
    /// Build manager for live-build processes.
    builds: Arc<B>,
    /// Debounce of resize storms.
    resizes: ResizeCoalescer<T>,
    /// Session identity registry.
    registry: Arc<SessionRegistry>,
}

impl<T: TerminalManager, B: BuildManager> CommandRouter<T, B> {
    /// Create a new command router with the given dependencies.
    pub fn new(
        terminals: Arc<T>,
        builds: Arc<B>,
        registry: Arc<SessionRegistry>,
        resize_window: Duration,
    ) -> Self {
        let resizes = ResizeCoalescer::new(Arc::clone(&terminals), resize_window);
        Self {
            terminals,
            builds,
            resizes,
            registry,
        }
    }

    /// Returns the resize coalescer.
    pub fn resizes(&self) -> &ResizeCoalescer<T> {
        &self.resizes
    }

    /// Routes a command and converts failures into an error response.
    pub async fn route(&self, command: Command) -> Response {
        let session_id = command.session_id().cloned();
        let name = command.name();
        match self.dispatch(command).await {
            Ok(response) => response,
            Err(e) => {
                debug!(command = name, session_id = ?session_id, error = %e, "Command failed");
                Response::Error(e.to_error_message(session_id))
            }
        }
    }

    /// Routes a command to its handler.
    pub async fn dispatch(&self, command: Command) -> RouterResult {
        match command {
            Command::SpawnTerminal(req) => self.handle_spawn_terminal(req).await,
            Command::PtyWrite(req) => self.handle_pty_write(req).await,
            Command::PtyResize(req) => self.handle_pty_resize(req),
            Command::KillTerminal(req) => self.handle_kill_terminal(req).await,
            Command::StartBuild(req) => self.handle_start_build(req).await,
            Command::StopBuild(req) => self.handle_stop_build(req).await,
            Command::BuildStatus(req) => self.handle_build_status(req),
            Command::DetachSession(req) => self.handle_detach(req).await,
            Command::Ping => Ok(Response::Pong),
        }
    }

    // =========================================================================
    // Terminal Handlers
    // =========================================================================

    async fn handle_spawn_terminal(&self, req: SpawnTerminal) -> RouterResult {
        validate_size(req.cols, req.rows)?;
        info!(
            session_id = %req.session_id,
            cols = req.cols,
            rows = req.rows,
            shell = ?req.shell,
            "Spawning terminal"
        );

        self.terminals.spawn(req).await?;
        Ok(Response::Ack)
    }

    async fn handle_pty_write(&self, req: PtyWrite) -> RouterResult {
        self.terminals.write(&req.session_id, req.data).await?;
        Ok(Response::Ack)
    }

    fn handle_pty_resize(&self, req: PtyResize) -> RouterResult {
        validate_size(req.cols, req.rows)?;
        self.resizes.request(&req.session_id, req.cols, req.rows)?;
        Ok(Response::Ack)
    }

    async fn handle_kill_terminal(&self, req: KillTerminal) -> RouterResult {
        info!(session_id = %req.session_id, "Killing terminal");

        self.resizes.cancel(&req.session_id);
        self.terminals.kill(&req.session_id).await?;
        Ok(Response::Ack)
    }

    // =========================================================================
    // Build Handlers
    // =========================================================================

    async fn handle_start_build(&self, req: StartBuild) -> RouterResult {
        if req.interpreter_path.trim().is_empty() {
            return Err(RouterError::InvalidRequest(
                "interpreter_path must not be empty".to_string(),
            ));
        }
        if req.project_path.trim().is_empty() {
            return Err(RouterError::InvalidRequest(
                "project_path must not be empty".to_string(),
            ));
        }
        info!(
            session_id = %req.session_id,
            project = %req.project_path,
            port = req.port,
            "Starting build server"
        );

        let port = self.builds.start(req).await?;
        Ok(Response::AssignedPort { port })
    }

    async fn handle_stop_build(&self, req: StopBuild) -> RouterResult {
        info!(session_id = %req.session_id, "Stopping build server");

        self.builds.stop(&req.session_id).await?;
        Ok(Response::Ack)
    }

    fn handle_build_status(&self, req: BuildStatusRequest) -> RouterResult {
        Ok(Response::BuildStatus(self.builds.status(&req.session_id)))
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_detach(&self, req: DetachSession) -> RouterResult {
        let session_id = req.session_id;
        info!(session_id = %session_id, "Detaching session");

        self.resizes.cancel(&session_id);
        let (terminal, build) = tokio::join!(
            self.terminals.kill(&session_id),
            self.builds.stop(&session_id)
        );
        if let Err(e) = &terminal {
            warn!(session_id = %session_id, error = %e, "Terminal teardown failed");
        }
        if let Err(e) = &build {
            warn!(session_id = %session_id, error = %e, "Build teardown failed");
        }
        terminal?;
        build?;

        self.registry.unregister(&session_id)?;
        Ok(Response::Ack)
    }
}

fn validate_size(cols: u16, rows: u16) -> Result<(), RouterError> {
    if cols == 0 || rows == 0 {
        return Err(RouterError::InvalidRequest(format!(
            "terminal size must be non-zero, got {}x{}",
            cols, rows
        )));
    }
    Ok(())
}
