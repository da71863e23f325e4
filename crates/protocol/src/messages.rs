//! Protocol message definitions for Orthrus.
//!
//! This module defines the commands a front end issues, the responses the
//! bridge returns for them, and the session-tagged events it streams back.
//! On stream transports every message travels as one JSON object per line.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorMessage, ProtocolError, Result};
use crate::SessionId;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum size of one encoded frame line.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Commands
// ============================================================================

/// Commands issued by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Spawn an interactive shell for a session.
    SpawnTerminal(SpawnTerminal),
    /// Forward raw input bytes to a session's shell.
    PtyWrite(PtyWrite),
    /// Change a session's terminal geometry.
    PtyResize(PtyResize),
    /// Terminate a session's shell.
    KillTerminal(KillTerminal),
    /// Launch the live documentation build server for a session.
    StartBuild(StartBuild),
    /// Stop a session's build server.
    StopBuild(StopBuild),
    /// Query a session's build state snapshot.
    BuildStatus(BuildStatusRequest),
    /// Tear down everything owned by a session and forget the id.
    DetachSession(DetachSession),
    /// Liveness check.
    Ping,
}

impl Command {
    /// Returns the session id the command targets, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Command::SpawnTerminal(c) => Some(&c.session_id),
            Command::PtyWrite(c) => Some(&c.session_id),
            Command::PtyResize(c) => Some(&c.session_id),
            Command::KillTerminal(c) => Some(&c.session_id),
            Command::StartBuild(c) => Some(&c.session_id),
            Command::StopBuild(c) => Some(&c.session_id),
            Command::BuildStatus(c) => Some(&c.session_id),
            Command::DetachSession(c) => Some(&c.session_id),
            Command::Ping => None,
        }
    }

    /// Returns the command name used in logs and the desktop command surface.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SpawnTerminal(_) => "spawn_terminal",
            Command::PtyWrite(_) => "pty_write",
            Command::PtyResize(_) => "pty_resize",
            Command::KillTerminal(_) => "kill_terminal",
            Command::StartBuild(_) => "start_build",
            Command::StopBuild(_) => "stop_build",
            Command::BuildStatus(_) => "build_status",
            Command::DetachSession(_) => "detach_session",
            Command::Ping => "ping",
        }
    }
}

/// Request to spawn a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnTerminal {
    /// Session the shell belongs to.
    pub session_id: SessionId,
    /// Working directory (default: the bridge's own working directory).
    #[serde(default)]
    pub cwd: Option<String>,
    /// Shell override (default: configured shell, then `$SHELL`).
    #[serde(default)]
    pub shell: Option<String>,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
}

/// Raw input for a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyWrite {
    /// Target session.
    pub session_id: SessionId,
    /// Bytes forwarded verbatim (base64 on the wire).
    #[serde(with = "crate::payload")]
    pub data: Bytes,
}

/// Terminal resize request for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyResize {
    /// Target session.
    pub session_id: SessionId,
    /// New width in columns.
    pub cols: u16,
    /// New height in rows.
    pub rows: u16,
}

/// Request to terminate a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillTerminal {
    /// Target session.
    pub session_id: SessionId,
}

/// Request to launch a live build server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBuild {
    /// Session the build belongs to.
    pub session_id: SessionId,
    /// Project root; the build process runs here.
    pub project_path: String,
    /// Documentation sources, relative to the project root.
    pub source_dir: String,
    /// Build output directory, relative to the project root.
    pub build_dir: String,
    /// Interpreter used to run the build module.
    pub interpreter_path: String,
    /// Preferred port, 0 to let the build server pick one.
    #[serde(default)]
    pub port: u16,
    /// Extra arguments appended to the build command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Request to stop a live build server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopBuild {
    /// Target session.
    pub session_id: SessionId,
}

/// Request for a build state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatusRequest {
    /// Target session.
    pub session_id: SessionId,
}

/// Request to tear down a whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachSession {
    /// Target session.
    pub session_id: SessionId,
}

// ============================================================================
// Responses
// ============================================================================

/// Outcome of a single command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    /// The command completed.
    Ack,
    /// The build server was launched. `None` means the port announcement
    /// did not arrive within the startup window; `build_started` follows.
    AssignedPort {
        /// Port the build server announced.
        port: Option<u16>,
    },
    /// Build state snapshot, `None` if no build is live for the session.
    BuildStatus(Option<BuildStatusInfo>),
    /// Answer to [`Command::Ping`].
    Pong,
    /// The command failed.
    Error(ErrorMessage),
}

impl Response {
    /// Returns true if the response reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

/// Snapshot of one live build session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatusInfo {
    /// Announced port, unset while the server is starting.
    pub port: Option<u16>,
    /// Whether the process is alive.
    pub running: bool,
    /// Text of the last failed rebuild, cleared by a successful one.
    pub last_error: Option<String>,
}

// ============================================================================
// Events
// ============================================================================

/// Session-tagged events streamed to the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Raw output chunk from a shell.
    PtyData(PtyData),
    /// A shell terminated. Last event for that shell.
    PtyExit(PtyExit),
    /// The build server announced its port.
    BuildStarted(BuildStarted),
    /// A full documentation rebuild completed.
    BuildRebuilt(BuildRebuilt),
    /// A rebuild failed; the server keeps running.
    BuildError(BuildFailure),
    /// The build server exited on its own (crash, external kill).
    BuildTerminated(BuildTerminated),
}

impl Event {
    /// Returns the session the event belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Event::PtyData(e) => &e.session_id,
            Event::PtyExit(e) => &e.session_id,
            Event::BuildStarted(e) => &e.session_id,
            Event::BuildRebuilt(e) => &e.session_id,
            Event::BuildError(e) => &e.session_id,
            Event::BuildTerminated(e) => &e.session_id,
        }
    }

    /// Returns the event name emitted to the desktop front end.
    pub fn name(&self) -> &'static str {
        match self {
            Event::PtyData(_) => "pty_data",
            Event::PtyExit(_) => "pty_exit",
            Event::BuildStarted(_) => "build_started",
            Event::BuildRebuilt(_) => "build_rebuilt",
            Event::BuildError(_) => "build_error",
            Event::BuildTerminated(_) => "build_terminated",
        }
    }
}

/// Raw shell output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyData {
    /// Source session.
    pub session_id: SessionId,
    /// Output bytes exactly as produced (base64 on the wire).
    #[serde(with = "crate::payload")]
    pub data: Bytes,
}

/// Shell termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyExit {
    /// Source session.
    pub session_id: SessionId,
    /// Exit code of the shell process.
    pub exit_code: i32,
}

/// Build server ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStarted {
    /// Source session.
    pub session_id: SessionId,
    /// Port the server is listening on. Never 0.
    pub port: u16,
}

/// Successful rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRebuilt {
    /// Source session.
    pub session_id: SessionId,
}

/// Failed rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    /// Source session.
    pub session_id: SessionId,
    /// Error text extracted from the build output.
    pub message: String,
}

/// Unexpected build server exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTerminated {
    /// Source session.
    pub session_id: SessionId,
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
}

// ============================================================================
// Wire frames
// ============================================================================

/// A command together with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Request id echoed in the matching response.
    pub id: u64,
    /// The command.
    pub command: Command,
}

impl ClientFrame {
    /// Creates a new client frame.
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }

    /// Encodes the frame as one newline-terminated JSON line.
    pub fn to_json_line(&self) -> Result<String> {
        encode_line(self)
    }

    /// Decodes a frame from one JSON line.
    pub fn from_json_line(line: &str) -> Result<Self> {
        decode_line(line)
    }
}

/// Anything the bridge writes to a stream transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to the client frame with the same id.
    Response {
        /// Id of the client frame being answered.
        id: u64,
        /// The outcome.
        response: Response,
    },
    /// An asynchronous session event.
    Event {
        /// The event.
        event: Event,
    },
}

impl ServerFrame {
    /// Encodes the frame as one newline-terminated JSON line.
    pub fn to_json_line(&self) -> Result<String> {
        encode_line(self)
    }

    /// Decodes a frame from one JSON line.
    pub fn from_json_line(line: &str) -> Result<Self> {
        decode_line(line)
    }
}

fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    if line.len() + 1 > MAX_LINE_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: line.len() + 1,
            max: MAX_LINE_BYTES,
        });
    }
    line.push('\n');
    Ok(line)
}

fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: line.len(),
            max: MAX_LINE_BYTES,
        });
    }
    Ok(serde_json::from_str(line.trim())?)
}
