//! Bridge orchestrator for wiring together all components.
//!
//! This module provides the `BridgeOrchestrator` that builds the session
//! registry, the event router, the terminal and build subsystems and the
//! command router on top of them, and tears every live child down on
//! shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::{Command, Response, SessionId};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::build::BuildSupervisor;
use crate::config::Config;
use crate::events::{EventRouter, EventSubscription};
use crate::router::{CommandRouter, RouterError};
use crate::session::{PtyBridge, SessionRegistry};

/// Bridge orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Accepting commands.
    Running,
    /// Tearing down live sessions.
    ShuttingDown,
    /// All children are gone.
    Stopped,
}

/// The concrete router type used by the bridge.
pub type BridgeRouter = CommandRouter<PtyBridge, BuildSupervisor>;

/// Bridge orchestrator that owns all subsystems.
pub struct BridgeOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: RwLock<OrchestratorState>,
    /// Session identity and process handles.
    registry: Arc<SessionRegistry>,
    /// Fan-out of session events.
    events: Arc<EventRouter>,
    /// Terminal subsystem.
    terminals: Arc<PtyBridge>,
    /// Build subsystem.
    builds: Arc<BuildSupervisor>,
    /// Command router.
    router: BridgeRouter,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl BridgeOrchestrator {
    /// Creates a new bridge orchestrator from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = Arc::new(SessionRegistry::new());
        let events = Arc::new(EventRouter::new(Arc::clone(&registry)));
        let terminals = Arc::new(PtyBridge::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            config.terminal.clone(),
        ));
        let builds = Arc::new(BuildSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            config.build.clone(),
        ));
        let router = CommandRouter::new(
            Arc::clone(&terminals),
            Arc::clone(&builds),
            Arc::clone(&registry),
            config.terminal.resize_coalesce(),
        );

        info!(
            resize_coalesce_ms = config.terminal.resize_coalesce_ms,
            build_module = %config.build.module,
            "Bridge orchestrator ready"
        );

        Ok(Self {
            config,
            state: RwLock::new(OrchestratorState::Running),
            registry,
            events,
            terminals,
            builds,
            router,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Handles one command and returns its response.
    pub async fn handle(&self, command: Command) -> Response {
        if *self.state.read().await != OrchestratorState::Running {
            let error = RouterError::Internal("bridge is shutting down".to_string());
            return Response::Error(error.to_error_message(command.session_id().cloned()));
        }
        self.router.route(command).await
    }

    /// Subscribes to the events of every session.
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// Subscribes to the events of one session.
    pub fn subscribe_session(&self, session_id: SessionId) -> EventSubscription {
        self.events.subscribe_session(session_id)
    }

    /// Kills every terminal and stops every build server.
    ///
    /// Further commands are refused. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Running {
                return;
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!(sessions = self.registry.len(), "Shutting down bridge...");
        self.shutdown_token.cancel();

        tokio::join!(self.terminals.kill_all(), self.builds.stop_all());

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Bridge stopped");
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the event router.
    pub fn events(&self) -> &Arc<EventRouter> {
        &self.events
    }

    /// Returns the command router.
    pub fn router(&self) -> &BridgeRouter {
        &self.router
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
