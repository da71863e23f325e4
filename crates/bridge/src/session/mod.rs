//! Session management module.
//!
//! This module provides the session registry, interactive PTY sessions and
//! the resize coalescer that sits in front of them. Terminals are spawned,
//! written to, resized and killed by session id.

use std::future::Future;

use bytes::Bytes;
use protocol::messages::SpawnTerminal;
use protocol::SessionId;
use thiserror::Error;

pub mod pty;
pub mod registry;
pub mod resize;

pub use pty::{PtyBridge, PtySession};
pub use registry::{Instance, ProcessKind, SessionRegistry, Supervised};
pub use resize::{ResizeApplier, ResizeCoalescer};

/// Errors that can occur during terminal session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No live terminal exists for the session.
    #[error("no terminal for session {0}")]
    NotFound(SessionId),

    /// A process of the given kind is already live for the session.
    #[error("{kind} already running for session {id}")]
    AlreadyRunning {
        /// The session id.
        id: SessionId,
        /// Which slot is occupied.
        kind: ProcessKind,
    },

    /// Failed to launch the shell.
    #[error("failed to spawn terminal: {0}")]
    SpawnFailed(String),

    /// The shell's input stream is closed.
    #[error("terminal input closed for session {0}")]
    InputClosed(SessionId),

    /// Writing to the shell failed.
    #[error("failed to write to terminal {id}: {message}")]
    WriteFailed {
        /// The session id.
        id: SessionId,
        /// OS error text.
        message: String,
    },

    /// Failed to resize the PTY.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// The shell did not die within the grace period.
    #[error("terminal for session {0} did not terminate in time")]
    TerminationTimeout(SessionId),
}

/// Terminal operations used by the command router.
///
/// Implementations must be thread-safe and suitable for concurrent access
/// across session ids.
pub trait TerminalManager: ResizeApplier {
    /// Spawns a shell for the session.
    fn spawn(&self, request: SpawnTerminal)
        -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Forwards raw input bytes to the session's shell.
    fn write(
        &self,
        session_id: &SessionId,
        data: Bytes,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Terminates the session's shell. Absent sessions succeed silently.
    fn kill(&self, session_id: &SessionId) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Terminates every live shell.
    fn kill_all(&self) -> impl Future<Output = ()> + Send;
}
