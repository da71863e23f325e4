//! # Orthrus Bridge Library
//!
//! This crate provides the session bridge for Orthrus, the documentation
//! workspace. For every editor session the bridge owns up to two child
//! processes: an interactive terminal on a pseudo-terminal and a live
//! documentation build server.
//!
//! ## Overview
//!
//! - **Terminals**: spawn a shell on a PTY, forward input, stream output,
//!   coalesce resize storms and terminate on request
//! - **Build servers**: launch the live build server in its own process
//!   group, detect its port from its output, report rebuilds and failures
//! - **Event routing**: deliver output and lifecycle events in order,
//!   dropping anything from a replaced child
//! - **Transports**: a Unix socket or stdio speaking newline-delimited JSON
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Bridge Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                   Command Router                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  PTY Bridge  │  │    Build     │  │    Event Router      │   │
//! │  │              │  │  Supervisor  │  │                      │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                                 │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                  Session Registry                          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bridge::{BridgeOrchestrator, Config};
//! use bridge::protocol::Command;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = BridgeOrchestrator::new(Config::load_default()?)?;
//!
//!     let response = orchestrator.handle(Command::Ping).await;
//!     println!("{:?}", response);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session registry, PTY bridge and resize coalescing
//! - [`build`]: Live build server supervision and output classification
//! - [`events`]: Event fan-out to front ends
//! - [`router`]: Command routing to subsystems
//! - [`ipc`]: Socket and stdio transports
//! - [`orchestrator`]: Main bridge coordinator

pub mod build;
pub mod config;
pub mod events;
pub mod ipc;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{PtyBridge, SessionError, SessionRegistry, TerminalManager};

// Re-export build types for convenience
pub use build::{BuildError, BuildManager, BuildSupervisor};

// Re-export event types for convenience
pub use events::{EventRouter, EventSubscription};

// Re-export router types for convenience
pub use router::{CommandRouter, RouterError, RouterResult};

// Re-export orchestrator types for convenience
pub use orchestrator::{BridgeOrchestrator, OrchestratorState};
