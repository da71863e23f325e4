//! # Orthrus Protocol Library
//!
//! This crate defines the command/event protocol spoken between the Orthrus
//! session bridge and its front ends (the desktop webview, or any client of
//! the newline-delimited JSON IPC transport).
//!
//! ## Overview
//!
//! Every interaction is keyed by a [`SessionId`], an opaque token minted by
//! the front end for one workspace attachment:
//!
//! - **Commands** flow from the front end to the bridge and are answered by
//!   exactly one [`Response`] (request/acknowledgment channel).
//! - **Events** flow from the bridge to the front end asynchronously and are
//!   ordered per session (publish/subscribe channel).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   ClientFrame { id, Command }   ┌──────────────────┐
//! │                      │ ──────────────────────────────▶ │                  │
//! │      Front end       │                                 │  Session bridge  │
//! │ (webview / IPC peer) │ ◀────────────────────────────── │ (PTY + builds)   │
//! └──────────────────────┘  ServerFrame::Response / Event  └──────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientFrame, Command, SessionId};
//! use protocol::messages::SpawnTerminal;
//!
//! let session_id = SessionId::generate();
//! let frame = ClientFrame::new(
//!     1,
//!     Command::SpawnTerminal(SpawnTerminal {
//!         session_id,
//!         cwd: None,
//!         shell: None,
//!         cols: 80,
//!         rows: 24,
//!     }),
//! );
//!
//! let line = frame.to_json_line().unwrap();
//! let decoded = ClientFrame::from_json_line(&line).unwrap();
//! assert_eq!(decoded, frame);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Commands, responses, events and wire frames
//! - [`error`]: Error types and protocol error codes

pub mod error;
pub mod messages;
mod payload;
mod session_id;

pub use error::{ErrorCode, ErrorMessage, ProtocolError, Result};
pub use messages::{
    BuildStatusInfo, ClientFrame, Command, Event, Response, ServerFrame, MAX_LINE_BYTES,
    PROTOCOL_VERSION,
};
pub use session_id::SessionId;
