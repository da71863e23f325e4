//! IPC server for front ends connecting over Unix Domain Sockets or stdio.
//!
//! Each connection reads one [`ClientFrame`] per line and writes
//! [`ServerFrame`]s back: the response to every request, tagged with the
//! request id, interleaved with the event stream of all sessions.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::{
    ClientFrame, Command, ErrorCode, ErrorMessage, ProtocolError, Response, ServerFrame,
    SessionId, MAX_LINE_BYTES,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::BridgeOrchestrator;
use crate::session::ProcessKind;

type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// A server that listens for IPC connections on a Unix Domain Socket.
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// This will create the socket file and any necessary parent directories.
    /// If a socket file already exists at the path, it will be removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The parent directories cannot be created
    /// - The existing socket cannot be removed
    /// - The socket cannot be bound
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<UnixStream, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Serves connections until `shutdown` is cancelled.
    ///
    /// Every connection gets its own task. Sessions outlive the connection
    /// that created them.
    pub async fn serve(
        &self,
        orchestrator: Arc<BridgeOrchestrator>,
        shutdown: CancellationToken,
    ) -> Result<(), io::Error> {
        tracing::info!(path = %self.path.display(), "IPC server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept IPC connection");
                            continue;
                        }
                    };
                    let orchestrator = Arc::clone(&orchestrator);
                    tokio::spawn(async move {
                        tracing::debug!("IPC client connected");
                        let (read_half, write_half) = tokio::io::split(stream);
                        if let Err(e) = serve_connection(read_half, write_half, orchestrator).await {
                            tracing::debug!(error = %e, "IPC connection ended with error");
                        }
                        tracing::debug!("IPC client disconnected");
                    });
                }
            }
        }
        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Serves one front end over a byte stream until it closes its side.
///
/// Commands for one session are executed in arrival order; commands for
/// different sessions run concurrently.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    orchestrator: Arc<BridgeOrchestrator>,
) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frames, frames_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frames(writer, frames_rx));

    let mut subscription = orchestrator.subscribe();
    let event_frames = frames.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if event_frames.send(ServerFrame::Event { event }).is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut lanes: HashMap<SessionId, mpsc::UnboundedSender<ClientFrame>> = HashMap::new();

    let result = loop {
        line.clear();
        match read_line_limited(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(LineRead::Eof) => break Ok(()),
            Ok(LineRead::TooLong) => {
                tracing::warn!(max = MAX_LINE_BYTES, "Rejected oversized IPC line");
                send_response(
                    &frames,
                    0,
                    invalid_request(format!("line exceeds {} bytes", MAX_LINE_BYTES)),
                );
            }
            Ok(LineRead::Line) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match ClientFrame::from_json_line(text) {
                    Ok(frame) => dispatch(frame, &orchestrator, &frames, &mut lanes).await,
                    Err(e) => {
                        tracing::debug!(error = %e, "Malformed IPC request");
                        send_response(&frames, recover_id(text), invalid_request(e.to_string()));
                    }
                }
            }
            Err(e) => break Err(IpcError::Io(e)),
        }
    };

    forwarder.abort();
    drop(lanes);
    drop(frames);
    // Flushes responses of commands still in flight.
    let _ = writer_task.await;
    result
}

async fn dispatch(
    frame: ClientFrame,
    orchestrator: &Arc<BridgeOrchestrator>,
    frames: &FrameSender,
    lanes: &mut HashMap<SessionId, mpsc::UnboundedSender<ClientFrame>>,
) {
    let Some(session_id) = frame.command.session_id().cloned() else {
        let response = orchestrator.handle(frame.command).await;
        send_response(frames, frame.id, response);
        return;
    };

    let frame = match lanes.get(&session_id) {
        Some(lane) => match lane.send(frame) {
            Ok(()) => return,
            Err(mpsc::error::SendError(frame)) => frame,
        },
        None => frame,
    };
    let lane = spawn_lane(Arc::clone(orchestrator), frames.clone());
    if let Err(mpsc::error::SendError(frame)) = lane.send(frame) {
        send_response(
            frames,
            frame.id,
            Response::Error(ErrorMessage {
                code: ErrorCode::Internal,
                message: "session queue closed".to_string(),
                session_id: Some(session_id),
                recoverable: true,
            }),
        );
        return;
    }
    lanes.insert(session_id, lane);
}

/// Runs one session's commands in arrival order.
///
/// A build start only holds the lane until its launch is reserved; waiting
/// for the port announcement happens off the lane. Later stops and detaches
/// still see the launch because teardown waits for reservations to settle.
fn spawn_lane(
    orchestrator: Arc<BridgeOrchestrator>,
    frames: FrameSender,
) -> mpsc::UnboundedSender<ClientFrame> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Command::StartBuild(request) = &frame.command else {
                execute(frame, Arc::clone(&orchestrator), frames.clone()).await;
                continue;
            };

            let session_id = request.session_id.clone();
            let registry = Arc::clone(orchestrator.registry());
            let since = registry.next_instance();
            let mut start = tokio::spawn(execute(frame, Arc::clone(&orchestrator), frames.clone()));
            tokio::select! {
                _ = &mut start => {}
                _ = registry.launched_since(&session_id, ProcessKind::Build, since) => {}
            }
        }
    });
    tx
}

async fn execute(frame: ClientFrame, orchestrator: Arc<BridgeOrchestrator>, frames: FrameSender) {
    let response = orchestrator.handle(frame.command).await;
    send_response(&frames, frame.id, response);
}

fn send_response(frames: &FrameSender, id: u64, response: Response) {
    let _ = frames.send(ServerFrame::Response { id, response });
}

fn invalid_request(message: String) -> Response {
    Response::Error(ErrorMessage {
        code: ErrorCode::InvalidRequest,
        message,
        session_id: None,
        recoverable: false,
    })
}

/// Best-effort request id of a frame that failed to decode.
fn recover_id(line: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<ServerFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let line = match frame.to_json_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Dropped unencodable frame");
                continue;
            }
        };

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            tracing::debug!(error = %e, "IPC peer stopped reading");
            break;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Reads one newline-terminated line into `buf` without the newline.
///
/// A line longer than `limit` is consumed entirely but not stored.
async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut overflow = false;
    loop {
        let (consumed, complete) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(if overflow {
                    LineRead::TooLong
                } else if buf.is_empty() {
                    LineRead::Eof
                } else {
                    LineRead::Line
                });
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            if !overflow {
                if buf.len() + chunk.len() > limit {
                    overflow = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(chunk);
                }
            }
            match newline {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);

        if complete {
            return Ok(if overflow {
                LineRead::TooLong
            } else {
                LineRead::Line
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use protocol::messages::SpawnTerminal;
    use tempfile::tempdir;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::config::Config;

    fn test_orchestrator() -> Arc<BridgeOrchestrator> {
        let mut config = Config::default();
        config.terminal.shell = Some("/bin/sh".to_string());
        config.terminal.login_shell = false;
        Arc::new(BridgeOrchestrator::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_server_bind_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_bind_removes_existing_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_read_line_limited() {
        let input: &[u8] = b"first\n\nsecond-without-newline";
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();

        assert_eq!(
            read_line_limited(&mut reader, &mut buf, 64).await.unwrap(),
            LineRead::Line
        );
        assert_eq!(buf, b"first");

        buf.clear();
        assert_eq!(
            read_line_limited(&mut reader, &mut buf, 64).await.unwrap(),
            LineRead::Line
        );
        assert!(buf.is_empty());

        buf.clear();
        assert_eq!(
            read_line_limited(&mut reader, &mut buf, 64).await.unwrap(),
            LineRead::Line
        );
        assert_eq!(buf, b"second-without-newline");

        buf.clear();
        assert_eq!(
            read_line_limited(&mut reader, &mut buf, 64).await.unwrap(),
            LineRead::Eof
        );
    }

    #[tokio::test]
    async fn test_read_line_limited_skips_oversized_line() {
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\nok\n");
        let mut reader = BufReader::with_capacity(16, input.as_slice());
        let mut buf = Vec::new();

        assert_eq!(
            read_line_limited(&mut reader, &mut buf, 10).await.unwrap(),
            LineRead::TooLong
        );
        buf.clear();
        assert_eq!(
            read_line_limited(&mut reader, &mut buf, 10).await.unwrap(),
            LineRead::Line
        );
        assert_eq!(buf, b"ok");
    }

    #[test]
    fn test_recover_id() {
        assert_eq!(recover_id(r#"{"id": 42, "command": {"type": "bogus"}}"#), 42);
        assert_eq!(recover_id("not json"), 0);
        assert_eq!(recover_id(r#"{"command": null}"#), 0);
    }

    /// Drives `serve_connection` over an in-memory pipe.
    struct Peer {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    }

    impl Peer {
        fn start(orchestrator: Arc<BridgeOrchestrator>) -> Self {
            let (client, server) = duplex(64 * 1024);
            let (server_read, server_write) = tokio::io::split(server);
            tokio::spawn(serve_connection(server_read, server_write, orchestrator));
            let (client_read, client_write) = tokio::io::split(client);
            Self {
                lines: BufReader::new(client_read).lines(),
                writer: client_write,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, frame: ClientFrame) {
            let line = frame.to_json_line().unwrap();
            self.send_raw(line.trim_end()).await;
        }

        /// Returns the response with `id`, skipping events.
        async fn response(&mut self, id: u64) -> Response {
            loop {
                let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                if let ServerFrame::Response { id: got, response } =
                    ServerFrame::from_json_line(&line).unwrap()
                {
                    if got == id {
                        return response;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_ping_over_connection() {
        let mut peer = Peer::start(test_orchestrator());
        peer.send(ClientFrame::new(7, Command::Ping)).await;
        assert_eq!(peer.response(7).await, Response::Pong);
    }

    #[tokio::test]
    async fn test_malformed_request_gets_invalid_request() {
        let mut peer = Peer::start(test_orchestrator());
        peer.send_raw(r#"{"id": 9, "command": {"type": "launch_missiles"}}"#)
            .await;

        match peer.response(9).await {
            Response::Error(e) => {
                assert_eq!(e.code, ErrorCode::InvalidRequest);
                assert!(!e.recoverable);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // The connection keeps working.
        peer.send(ClientFrame::new(10, Command::Ping)).await;
        assert_eq!(peer.response(10).await, Response::Pong);
    }

    #[tokio::test]
    async fn test_terminal_output_streams_as_events() {
        let orchestrator = test_orchestrator();
        let mut peer = Peer::start(Arc::clone(&orchestrator));
        let session_id = SessionId::from("ipc-term");

        peer.send(ClientFrame::new(
            1,
            Command::SpawnTerminal(SpawnTerminal {
                session_id: session_id.clone(),
                cwd: None,
                shell: None,
                cols: 80,
                rows: 24,
            }),
        ))
        .await;
        peer.send(ClientFrame::new(
            2,
            Command::PtyWrite(protocol::messages::PtyWrite {
                session_id: session_id.clone(),
                data: bytes::Bytes::from_static(b"echo ipc_$((6*7))\n"),
            }),
        ))
        .await;

        // Same-session commands complete in order.
        let mut seen = Vec::new();
        let mut output = String::new();
        while !output.contains("ipc_42") {
            let line = tokio::time::timeout(Duration::from_secs(5), peer.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match ServerFrame::from_json_line(&line).unwrap() {
                ServerFrame::Response { id, response } => {
                    assert_eq!(response, Response::Ack);
                    seen.push(id);
                }
                ServerFrame::Event {
                    event: protocol::Event::PtyData(data),
                } => output.push_str(&String::from_utf8_lossy(&data.data)),
                ServerFrame::Event { .. } => {}
            }
        }
        assert_eq!(seen.first(), Some(&1));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_right_after_spawn_is_ordered() {
        let orchestrator = test_orchestrator();
        let mut peer = Peer::start(Arc::clone(&orchestrator));
        let session_id = SessionId::from("ipc-spawn-kill");

        let spawn = ClientFrame::new(
            1,
            Command::SpawnTerminal(SpawnTerminal {
                session_id: session_id.clone(),
                cwd: None,
                shell: None,
                cols: 80,
                rows: 24,
            }),
        );
        let kill = ClientFrame::new(
            2,
            Command::KillTerminal(protocol::messages::KillTerminal {
                session_id: session_id.clone(),
            }),
        );
        // One write, so both frames are read before either runs.
        let batch = format!(
            "{}{}",
            spawn.to_json_line().unwrap(),
            kill.to_json_line().unwrap()
        );
        peer.writer.write_all(batch.as_bytes()).await.unwrap();

        let mut answered = Vec::new();
        while answered.len() < 2 {
            let line = tokio::time::timeout(Duration::from_secs(5), peer.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let ServerFrame::Response { id, response } = ServerFrame::from_json_line(&line).unwrap() {
                answered.push((id, response));
            }
        }
        assert_eq!(answered, vec![(1, Response::Ack), (2, Response::Ack)]);

        peer.send(ClientFrame::new(
            3,
            Command::PtyWrite(protocol::messages::PtyWrite {
                session_id: session_id.clone(),
                data: bytes::Bytes::from_static(b"ls\n"),
            }),
        ))
        .await;
        match peer.response(3).await {
            Response::Error(e) => assert_eq!(e.code, ErrorCode::NotFound),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(orchestrator.registry().terminal(&session_id).is_none());

        orchestrator.shutdown().await;
    }
}
