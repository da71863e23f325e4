//! Configuration management for the Orthrus bridge.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/orthrus/bridge.toml`.
//!
//! Project-scoped build settings (source and build directories, interpreter,
//! preferred port) are not stored here; they arrive with each `start_build`
//! command.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("resize_coalesce_ms must be between 1 and 1000, got {0}")]
    InvalidCoalesceWindow(u64),

    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{0} must contain at least one non-empty marker")]
    EmptyMarkers(&'static str),

    #[error("build module must not be empty")]
    EmptyModule,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Orthrus bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General bridge configuration.
    pub bridge: BridgeConfig,

    /// Interactive terminal configuration.
    pub terminal: TerminalConfig,

    /// Live documentation build configuration.
    pub build: BuildConfig,
}

/// General bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,

    /// IPC socket path. Uses the runtime directory when unset.
    pub socket_path: Option<PathBuf>,
}

/// Interactive terminal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell to launch. Falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,

    /// Start the shell as a login shell (`-l`).
    pub login_shell: bool,

    /// Value exported as `TERM`.
    pub term: String,

    /// Value exported as `COLORTERM`.
    pub colorterm: String,

    /// Resize coalescing window in milliseconds.
    pub resize_coalesce_ms: u64,

    /// How long `kill_terminal` waits for the shell to die.
    pub kill_grace_ms: u64,

    /// How long output is still drained after the shell exits.
    pub exit_drain_ms: u64,
}

/// Live documentation build configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    /// Interpreter module that runs the live build server.
    pub module: String,

    /// Interface the build server binds to.
    pub host: String,

    /// How long `start_build` waits for the port announcement.
    pub startup_timeout_secs: u64,

    /// How long a graceful stop waits before escalating to SIGKILL.
    pub stop_grace_ms: u64,

    /// Output fragments that mark a completed rebuild.
    pub success_markers: Vec<String>,

    /// Output fragments that mark a failed rebuild.
    pub error_markers: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            socket_path: None,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: None,
            login_shell: true,
            term: "xterm-256color".to_string(),
            colorterm: "truecolor".to_string(),
            resize_coalesce_ms: 30,
            kill_grace_ms: 3000,
            exit_drain_ms: 100,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            module: "sphinx_autobuild".to_string(),
            host: "127.0.0.1".to_string(),
            startup_timeout_secs: 30,
            stop_grace_ms: 3000,
            success_markers: vec![
                "build succeeded".to_string(),
                "build finished with problems".to_string(),
            ],
            error_markers: vec![
                "ERROR".to_string(),
                "error:".to_string(),
                "Exception occurred".to_string(),
                "Sphinx exited with exit code".to_string(),
            ],
        }
    }
}

impl TerminalConfig {
    /// Resolves the shell to launch, preferring an explicit override.
    pub fn resolve_shell(&self, requested: Option<&str>) -> String {
        requested
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.shell.clone().filter(|s| !s.is_empty()))
            .unwrap_or_else(default_shell)
    }

    pub fn resize_coalesce(&self) -> Duration {
        Duration::from_millis(self.resize_coalesce_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn exit_drain(&self) -> Duration {
        Duration::from_millis(self.exit_drain_ms)
    }
}

impl BuildConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("orthrus")
        .join("bridge.toml")
}

/// Returns the shell from the environment, or `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ORTHRUS_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - ORTHRUS_SHELL: Override the terminal shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ORTHRUS_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.bridge.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("ORTHRUS_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.terminal.shell = Some(shell);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let coalesce = self.terminal.resize_coalesce_ms;
        if !(1..=1000).contains(&coalesce) {
            return Err(ConfigError::InvalidCoalesceWindow(coalesce));
        }

        if self.terminal.kill_grace_ms == 0 {
            return Err(ConfigError::ZeroDuration("kill_grace_ms"));
        }
        if self.build.stop_grace_ms == 0 {
            return Err(ConfigError::ZeroDuration("stop_grace_ms"));
        }
        if self.build.startup_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("startup_timeout_secs"));
        }

        if let Some(shell) = &self.terminal.shell {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.bridge.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.bridge.log_level.clone()));
        }

        if self.build.module.trim().is_empty() {
            return Err(ConfigError::EmptyModule);
        }
        if !has_marker(&self.build.success_markers) {
            return Err(ConfigError::EmptyMarkers("success_markers"));
        }
        if !has_marker(&self.build.error_markers) {
            return Err(ConfigError::EmptyMarkers("error_markers"));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn has_marker(markers: &[String]) -> bool {
    markers.iter().any(|m| !m.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.bridge.log_level, "info");
        assert!(config.bridge.log_dir.is_none());
        assert!(config.terminal.shell.is_none());
        assert!(config.terminal.login_shell);
        assert_eq!(config.terminal.term, "xterm-256color");
        assert_eq!(config.terminal.colorterm, "truecolor");
        assert_eq!(config.terminal.resize_coalesce_ms, 30);
        assert_eq!(config.build.module, "sphinx_autobuild");
        assert_eq!(config.build.host, "127.0.0.1");
        assert_eq!(config.build.startup_timeout_secs, 30);
        assert!(config
            .build
            .success_markers
            .contains(&"build succeeded".to_string()));
        assert!(config.build.error_markers.contains(&"ERROR".to_string()));
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.terminal.resize_coalesce(), Duration::from_millis(30));
        assert_eq!(config.terminal.kill_grace(), Duration::from_secs(3));
        assert_eq!(config.build.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.build.stop_grace(), Duration::from_secs(3));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[bridge]
log_level = "debug"

[terminal]
resize_coalesce_ms = 50
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.bridge.log_level, "debug");
        assert_eq!(config.terminal.resize_coalesce_ms, 50);
        assert_eq!(config.terminal.kill_grace_ms, 3000);
        assert_eq!(config.build, BuildConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[bridge]
log_level = "warn"
log_dir = "/var/log/orthrus"
socket_path = "/tmp/orthrus.sock"

[terminal]
shell = "/bin/sh"
login_shell = false
term = "xterm"
colorterm = "24bit"
resize_coalesce_ms = 16
kill_grace_ms = 500
exit_drain_ms = 20

[build]
module = "custom_autobuild"
host = "0.0.0.0"
startup_timeout_secs = 5
stop_grace_ms = 1000
success_markers = ["done"]
error_markers = ["FAILED"]
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.bridge.log_dir, Some(PathBuf::from("/var/log/orthrus")));
        assert_eq!(
            config.bridge.socket_path,
            Some(PathBuf::from("/tmp/orthrus.sock"))
        );
        assert_eq!(config.terminal.shell.as_deref(), Some("/bin/sh"));
        assert!(!config.terminal.login_shell);
        assert_eq!(config.terminal.exit_drain_ms, 20);
        assert_eq!(config.build.module, "custom_autobuild");
        assert_eq!(config.build.success_markers, vec!["done".to_string()]);
        assert_eq!(config.build.error_markers, vec!["FAILED".to_string()]);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[bridge\nlog_level = ");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_helpful_error_messages() {
        let toml = r#"
[terminal]
resize_coalesce_ms = "fast"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
        assert!(err.contains("at position"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.bridge.log_level = "trace".to_string();
        config.terminal.shell = Some("/bin/sh".to_string());
        config.build.error_markers = vec!["boom".to_string()];

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("bridge.toml");

        let mut config = Config::default();
        config.build.startup_timeout_secs = 12;
        config.save(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(Config::load(&config_path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bridge.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("orthrus"));
        assert!(path.to_string_lossy().ends_with("bridge.toml"));
    }

    #[test]
    fn test_resolve_shell_prefers_request() {
        let config = TerminalConfig {
            shell: Some("/bin/zsh".to_string()),
            ..TerminalConfig::default()
        };
        assert_eq!(config.resolve_shell(Some("/bin/dash")), "/bin/dash");
        assert_eq!(config.resolve_shell(None), "/bin/zsh");
        assert_eq!(config.resolve_shell(Some("")), "/bin/zsh");
    }

    #[test]
    #[serial]
    fn test_resolve_shell_falls_back_to_env() {
        let saved = std::env::var("SHELL").ok();

        std::env::set_var("SHELL", "/bin/fish");
        assert_eq!(TerminalConfig::default().resolve_shell(None), "/bin/fish");

        std::env::remove_var("SHELL");
        assert_eq!(TerminalConfig::default().resolve_shell(None), "/bin/sh");

        if let Some(shell) = saved {
            std::env::set_var("SHELL", shell);
        }
    }

    // ========================================================================
    // Environment overrides
    // ========================================================================

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("ORTHRUS_SHELL");
        std::env::set_var("ORTHRUS_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.bridge.log_level, "debug");

        std::env::remove_var("ORTHRUS_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_shell() {
        std::env::remove_var("ORTHRUS_LOG_LEVEL");
        std::env::set_var("ORTHRUS_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.terminal.shell.as_deref(), Some("/bin/sh"));

        std::env::remove_var("ORTHRUS_SHELL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("ORTHRUS_LOG_LEVEL", "");
        std::env::set_var("ORTHRUS_SHELL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("ORTHRUS_LOG_LEVEL");
        std::env::remove_var("ORTHRUS_SHELL");
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_coalesce_window() {
        let mut config = Config::default();
        config.terminal.resize_coalesce_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCoalesceWindow(0))
        );

        config.terminal.resize_coalesce_ms = 1001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCoalesceWindow(1001))
        );

        config.terminal.resize_coalesce_ms = 1;
        assert!(config.validate().is_ok());
        config.terminal.resize_coalesce_ms = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_durations() {
        let mut config = Config::default();
        config.terminal.kill_grace_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("kill_grace_ms"))
        );

        let mut config = Config::default();
        config.build.stop_grace_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("stop_grace_ms"))
        );

        let mut config = Config::default();
        config.build.startup_timeout_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("startup_timeout_secs"))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_path_absolute_exists() {
        let mut config = Config::default();
        config.terminal.shell = Some("/bin/sh".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_shell_path_not_found() {
        let mut config = Config::default();
        config.terminal.shell = Some("/nonexistent/path/to/shell".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );

        config.terminal.shell = Some("definitely-not-a-shell-xyz".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_path_in_path() {
        let mut config = Config::default();
        config.terminal.shell = Some("sh".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        for level in ["trace", "debug", "info", "warn", "error", "INFO", "Warn"] {
            config.bridge.log_level = level.to_string();
            assert!(config.validate().is_ok(), "level {} rejected", level);
        }

        config.bridge.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_markers() {
        let mut config = Config::default();
        config.build.success_markers = vec![];
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyMarkers("success_markers"))
        );

        let mut config = Config::default();
        config.build.error_markers = vec![String::new()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyMarkers("error_markers"))
        );
    }

    #[test]
    fn test_validate_module() {
        let mut config = Config::default();
        config.build.module = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyModule));
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::InvalidCoalesceWindow(0).to_string(),
            "resize_coalesce_ms must be between 1 and 1000, got 0"
        );
        assert_eq!(
            ConfigError::ZeroDuration("kill_grace_ms").to_string(),
            "kill_grace_ms must be greater than 0"
        );
    }
}
