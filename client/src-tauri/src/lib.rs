//! Orthrus Tauri Application Library
//!
//! This module wires the session bridge into the desktop shell: every
//! command below forwards to the in-process [`BridgeOrchestrator`], and a
//! background task emits bridge events to the webview under their event
//! names (`pty_data`, `build_started`, ...).

use std::sync::Arc;

use bridge::{BridgeOrchestrator, Config};
use bytes::Bytes;
use protocol::messages::{
    BuildStatusInfo, BuildStatusRequest, DetachSession, KillTerminal, PtyResize, PtyWrite,
    SpawnTerminal, StartBuild, StopBuild,
};
use protocol::{Command, ErrorMessage, Response, SessionId};
use tauri::{AppHandle, Emitter, Manager, RunEvent, State};
use tauri_plugin_opener::OpenerExt;
use tracing_subscriber::EnvFilter;

type Bridge = Arc<BridgeOrchestrator>;

async fn execute(bridge: &BridgeOrchestrator, command: Command) -> Result<Response, ErrorMessage> {
    match bridge.handle(command).await {
        Response::Error(e) => Err(e),
        response => Ok(response),
    }
}

#[tauri::command]
async fn spawn_terminal(
    bridge: State<'_, Bridge>,
    session_id: String,
    cwd: Option<String>,
    shell: Option<String>,
    cols: u16,
    rows: u16,
) -> Result<(), ErrorMessage> {
    let command = Command::SpawnTerminal(SpawnTerminal {
        session_id: SessionId::from(session_id),
        cwd,
        shell,
        cols,
        rows,
    });
    execute(&bridge, command).await.map(|_| ())
}

#[tauri::command]
async fn pty_write(
    bridge: State<'_, Bridge>,
    session_id: String,
    data: String,
) -> Result<(), ErrorMessage> {
    let command = Command::PtyWrite(PtyWrite {
        session_id: SessionId::from(session_id),
        data: Bytes::from(data.into_bytes()),
    });
    execute(&bridge, command).await.map(|_| ())
}

#[tauri::command]
async fn pty_resize(
    bridge: State<'_, Bridge>,
    session_id: String,
    cols: u16,
    rows: u16,
) -> Result<(), ErrorMessage> {
    let command = Command::PtyResize(PtyResize {
        session_id: SessionId::from(session_id),
        cols,
        rows,
    });
    execute(&bridge, command).await.map(|_| ())
}

#[tauri::command]
async fn kill_terminal(bridge: State<'_, Bridge>, session_id: String) -> Result<(), ErrorMessage> {
    let command = Command::KillTerminal(KillTerminal {
        session_id: SessionId::from(session_id),
    });
    execute(&bridge, command).await.map(|_| ())
}

/// Returns the announced port, or `None` if the server is still starting.
#[tauri::command]
#[allow(clippy::too_many_arguments)]
async fn start_build(
    bridge: State<'_, Bridge>,
    session_id: String,
    project_path: String,
    source_dir: String,
    build_dir: String,
    interpreter_path: String,
    port: Option<u16>,
    extra_args: Option<Vec<String>>,
) -> Result<Option<u16>, ErrorMessage> {
    let command = Command::StartBuild(StartBuild {
        session_id: SessionId::from(session_id),
        project_path,
        source_dir,
        build_dir,
        interpreter_path,
        port: port.unwrap_or(0),
        extra_args: extra_args.unwrap_or_default(),
    });
    match execute(&bridge, command).await? {
        Response::AssignedPort { port } => Ok(port),
        _ => Ok(None),
    }
}

#[tauri::command]
async fn stop_build(bridge: State<'_, Bridge>, session_id: String) -> Result<(), ErrorMessage> {
    let command = Command::StopBuild(StopBuild {
        session_id: SessionId::from(session_id),
    });
    execute(&bridge, command).await.map(|_| ())
}

#[tauri::command]
async fn build_status(
    bridge: State<'_, Bridge>,
    session_id: String,
) -> Result<Option<BuildStatusInfo>, ErrorMessage> {
    let command = Command::BuildStatus(BuildStatusRequest {
        session_id: SessionId::from(session_id),
    });
    match execute(&bridge, command).await? {
        Response::BuildStatus(status) => Ok(status),
        _ => Ok(None),
    }
}

#[tauri::command]
async fn detach_session(bridge: State<'_, Bridge>, session_id: String) -> Result<(), ErrorMessage> {
    let command = Command::DetachSession(DetachSession {
        session_id: SessionId::from(session_id),
    });
    execute(&bridge, command).await.map(|_| ())
}

/// Opens the live preview in the system browser.
#[tauri::command]
fn open_in_browser(app: AppHandle, url: String) -> Result<(), String> {
    app.opener()
        .open_url(url.as_str(), None::<&str>)
        .map_err(|e| {
            tracing::warn!(url = %url, error = %e, "Failed to open browser");
            e.to_string()
        })
}

/// Emits every bridge event to the webview with its payload unwrapped.
fn forward_events(app: AppHandle, bridge: Bridge) {
    let mut subscription = bridge.subscribe();
    tauri::async_runtime::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let payload = match serde_json::to_value(&event) {
                Ok(mut value) => value
                    .get_mut("data")
                    .map(serde_json::Value::take)
                    .unwrap_or(value),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropped unencodable event");
                    continue;
                }
            };
            if let Err(e) = app.emit(event.name(), payload) {
                tracing::warn!(event = event.name(), error = %e, "Failed to emit event");
            }
        }
    });
}

/// Configure and run the Tauri application
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            let mut config = Config::load_default()?;
            config.apply_env_overrides();
            let bridge: Bridge = Arc::new(BridgeOrchestrator::new(config)?);

            forward_events(app.handle().clone(), Arc::clone(&bridge));
            app.manage(bridge);

            #[cfg(debug_assertions)]
            if let Some(window) = app.get_webview_window("main") {
                window.open_devtools();
            }
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            spawn_terminal,
            pty_write,
            pty_resize,
            kill_terminal,
            start_build,
            stop_build,
            build_status,
            detach_session,
            open_in_browser,
        ])
        .build(tauri::generate_context!());

    let app = match app {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build the desktop application");
            std::process::exit(1);
        }
    };

    app.run(|handle, event| {
        if let RunEvent::Exit = event {
            if let Some(bridge) = handle.try_state::<Bridge>() {
                tauri::async_runtime::block_on(bridge.shutdown());
            }
        }
    });
}
