//! Generate JSON test vectors for TypeScript front-end interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use bytes::Bytes;
use protocol::messages::*;
use protocol::{ErrorCode, ErrorMessage, SessionId};

fn main() {
    let session_id = SessionId::from("sess-1");

    // Test vector 1: Ping
    print_client_vector("ping", &ClientFrame::new(1, Command::Ping));

    // Test vector 2: SpawnTerminal with defaults
    print_client_vector(
        "spawn_terminal_default",
        &ClientFrame::new(
            2,
            Command::SpawnTerminal(SpawnTerminal {
                session_id: session_id.clone(),
                cwd: None,
                shell: None,
                cols: 80,
                rows: 24,
            }),
        ),
    );

    // Test vector 3: StartBuild
    print_client_vector(
        "start_build",
        &ClientFrame::new(
            3,
            Command::StartBuild(StartBuild {
                session_id: session_id.clone(),
                project_path: "/home/user/project".to_string(),
                source_dir: "docs".to_string(),
                build_dir: "_build/html".to_string(),
                interpreter_path: "python".to_string(),
                port: 0,
                extra_args: vec![],
            }),
        ),
    );

    // Test vector 4: pty_data event
    print_server_vector(
        "pty_data",
        &ServerFrame::Event {
            event: Event::PtyData(PtyData {
                session_id: session_id.clone(),
                data: Bytes::from_static(b"Hello"),
            }),
        },
    );

    // Test vector 5: assigned port response
    print_server_vector(
        "assigned_port",
        &ServerFrame::Response {
            id: 3,
            response: Response::AssignedPort { port: Some(8000) },
        },
    );

    // Test vector 6: Error response
    print_server_vector(
        "error",
        &ServerFrame::Response {
            id: 4,
            response: Response::Error(ErrorMessage {
                code: ErrorCode::NotFound,
                message: "no terminal for session sess-1".to_string(),
                session_id: Some(session_id),
                recoverable: true,
            }),
        },
    );
}

fn print_client_vector(name: &str, frame: &ClientFrame) {
    let line = frame.to_json_line().expect("serialization failed");
    println!("export const {} = {};", name, line.trim_end());
}

fn print_server_vector(name: &str, frame: &ServerFrame) {
    let line = frame.to_json_line().expect("serialization failed");
    println!("export const {} = {};", name, line.trim_end());
}
