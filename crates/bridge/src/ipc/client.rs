//! IPC client for talking to a running bridge over its Unix socket.
//!
//! The client sends one command at a time and waits for the response with
//! the matching request id. Events that arrive in the meantime are queued
//! and handed out by [`IpcClient::next_event`].

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{ClientFrame, Command, Event, Response, ServerFrame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the bridge via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
    next_id: u64,
    events: VecDeque<Event>,
    /// Partial line kept across timed-out reads.
    pending: Vec<u8>,
}

impl IpcClient {
    /// Connect to the bridge at the specified socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the bridge is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect to the bridge with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established in time.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
            next_id: 1,
            events: VecDeque::new(),
            pending: Vec::new(),
        }
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends a command and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be sent, the bridge closes the
    /// connection, a frame cannot be decoded or the operation times out.
    pub async fn request(&mut self, command: Command) -> Result<Response, IpcError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.request_internal(command))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn request_internal(&mut self, command: Command) -> Result<Response, IpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let line = ClientFrame::new(id, command).to_json_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            match self.read_frame().await? {
                ServerFrame::Response { id: got, response } if got == id => return Ok(response),
                ServerFrame::Response { id: got, .. } => {
                    tracing::debug!(id = got, "Ignoring response to another request");
                }
                ServerFrame::Event { event } => self.events.push_back(event),
            }
        }
    }

    /// Returns the next event, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if no event arrived in time.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<Option<Event>, IpcError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }

        let wait = async {
            loop {
                if let ServerFrame::Event { event } = self.read_frame().await? {
                    return Ok::<_, IpcError>(event);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(event) => event.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send a ping to check if the bridge is responsive.
    ///
    /// Returns `true` if the bridge answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.request(Command::Ping).await?;
        Ok(matches!(response, Response::Pong))
    }

    async fn read_frame(&mut self) -> Result<ServerFrame, IpcError> {
        let bytes_read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if bytes_read == 0 && self.pending.is_empty() {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bridge closed connection",
            )));
        }
        let line = std::mem::take(&mut self.pending);
        Ok(ServerFrame::from_json_line(String::from_utf8_lossy(&line).trim())?)
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}
