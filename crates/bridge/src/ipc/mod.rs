//! Newline-delimited JSON transport for front ends.
//!
//! The desktop shell talks to the bridge in-process; every other front end
//! connects over a Unix Domain Socket or drives the bridge through its
//! stdin/stdout. Both transports speak the same framing.
//!
//! ## Overview
//!
//! Each message is a single JSON object followed by a newline. The front end
//! sends [`protocol::ClientFrame`]s; the bridge answers every frame with a
//! [`protocol::ServerFrame::Response`] carrying the same id and streams
//! [`protocol::ServerFrame::Event`]s for all sessions on the same connection.
//!
//! ## Socket Path
//!
//! The socket path follows the XDG Base Directory Specification:
//! - Primary: `$XDG_RUNTIME_DIR/orthrus/bridge.sock`
//! - Fallback: `/tmp/orthrus-$UID/bridge.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridge::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket_path = get_socket_path();
//!     let mut client = IpcClient::connect(&socket_path).await?;
//!
//!     if client.ping().await? {
//!         println!("Bridge is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod server;

pub use client::IpcClient;
pub use server::{serve_connection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/orthrus/bridge.sock`
/// 2. Otherwise: `/tmp/orthrus-$UID/bridge.sock`
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var_os("XDG_RUNTIME_DIR").filter(|dir| !dir.is_empty()) {
        Some(runtime_dir) => PathBuf::from(runtime_dir).join("orthrus").join("bridge.sock"),
        None => {
            // Get UID by checking metadata of a file we own
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);

            PathBuf::from(format!("/tmp/orthrus-{}", uid)).join("bridge.sock")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<F: FnOnce()>(value: Option<&str>, f: F) {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        // SAFETY: env-mutating tests are serialized.
        unsafe {
            match value {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        f();
        // SAFETY: env-mutating tests are serialized.
        unsafe {
            match original {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        with_runtime_dir(Some("/run/user/1000"), || {
            assert_eq!(
                get_socket_path(),
                PathBuf::from("/run/user/1000/orthrus/bridge.sock")
            );
        });
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        with_runtime_dir(None, || {
            let path = get_socket_path();
            let path = path.to_str().unwrap();
            assert!(path.starts_with("/tmp/orthrus-"));
            assert!(path.ends_with("/bridge.sock"));
        });
    }

    #[test]
    #[serial]
    fn test_socket_path_is_absolute() {
        let path = get_socket_path();
        assert!(path.is_absolute());
        assert!(path.extension().is_some_and(|e| e == "sock"));
    }
}
