//! Live documentation build supervision.
//!
//! Each session may own one build server process. The supervisor launches
//! it, discovers the port it announces, turns its output into build events
//! and tears the whole process group down on request.

use std::future::Future;

use protocol::messages::{BuildStatusInfo, StartBuild};
use protocol::SessionId;
use thiserror::Error;

pub mod output;
pub mod supervisor;

pub use output::{OutputClassifier, OutputLine};
pub use supervisor::{BuildSession, BuildSupervisor};

/// Errors that can occur during build operations.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The session already has a live build server.
    #[error("build already running for session {0}")]
    AlreadyRunning(SessionId),

    /// The build server could not be launched or died during startup.
    #[error("failed to start build server: {0}")]
    SpawnFailed(String),

    /// The build server could not bind its port.
    #[error("build server for session {id} could not bind port {port}: {message}")]
    PortBindFailure {
        /// The session id.
        id: SessionId,
        /// The requested port (0 for automatic).
        port: u16,
        /// The server's own error line.
        message: String,
    },

    /// The build server did not die within the grace period.
    #[error("build server for session {0} did not terminate in time")]
    TerminationTimeout(SessionId),
}

/// Build operations used by the command router.
pub trait BuildManager: Send + Sync + 'static {
    /// Launches the build server and waits for its port announcement.
    ///
    /// Returns `None` if the server is still running but has not announced
    /// a port within the startup timeout.
    fn start(
        &self,
        request: StartBuild,
    ) -> impl Future<Output = Result<Option<u16>, BuildError>> + Send;

    /// Stops the session's build server. Absent builds succeed silently.
    fn stop(&self, session_id: &SessionId) -> impl Future<Output = Result<(), BuildError>> + Send;

    /// Returns a snapshot of the session's build server, if any.
    fn status(&self, session_id: &SessionId) -> Option<BuildStatusInfo>;

    /// Stops every build server, logging failures.
    fn stop_all(&self) -> impl Future<Output = ()> + Send;
}
