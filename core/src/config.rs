/// Configuration management for the Parley bridge.
/// Handles loading, parsing and validation of .parley/config.toml
use crate::errors::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Identity this bridge sends as (the `from` field of outbound messages)
    #[serde(default = "default_identity")]
    pub identity: String,

    /// Root of the shared tree visible to every participating container
    #[serde(default = "default_shared_root")]
    pub shared_root: PathBuf,

    /// Retry policy around the whole fallback chain
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Named-pipe transport settings
    #[serde(default)]
    pub pipe: PipeConfig,

    /// Terminal-device injection settings
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Signal-triggered transport settings
    #[serde(default)]
    pub signal: SignalConfig,

    /// Ephemeral-exec transport settings
    #[serde(default)]
    pub exec: ExecConfig,

    /// Container runtime client settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Shared-storage polling settings
    #[serde(default)]
    pub polling: PollingConfig,

    /// Correlated request settings
    #[serde(default)]
    pub requests: RequestConfig,

    /// Inbound event queue settings
    #[serde(default)]
    pub events: EventConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            shared_root: default_shared_root(),
            retry: RetryPolicy::default(),
            pipe: PipeConfig::default(),
            terminal: TerminalConfig::default(),
            signal: SignalConfig::default(),
            exec: ExecConfig::default(),
            runtime: RuntimeConfig::default(),
            polling: PollingConfig::default(),
            requests: RequestConfig::default(),
            events: EventConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Defaults rooted at `shared_root`, sending as `identity`.
    pub fn new(identity: impl Into<String>, shared_root: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            shared_root: shared_root.into(),
            ..Self::default()
        }
    }

    /// Directory holding one FIFO per target.
    pub fn pipes_dir(&self) -> PathBuf {
        self.shared_root.join("pipes")
    }

    /// Directory holding one polled inbox per target.
    pub fn messages_dir(&self) -> PathBuf {
        self.shared_root.join("messages")
    }

    /// Directory holding one signal-drained inbox per target.
    pub fn signals_dir(&self) -> PathBuf {
        self.shared_root.join("signals")
    }
}

fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "bridge".to_string())
}

fn default_shared_root() -> PathBuf {
    PathBuf::from("/shared/parley")
}

/// Fixed-count, fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts of the whole fallback chain (1 = no retry)
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

/// Named-pipe transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// How long to wait for a reader before treating the send as failed
    #[serde(default = "default_pipe_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Upper bound on a single write once the pipe is open
    #[serde(default = "default_pipe_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_pipe_open_timeout_ms(),
            write_timeout_ms: default_pipe_write_timeout_ms(),
        }
    }
}

fn default_pipe_open_timeout_ms() -> u64 {
    500
}

fn default_pipe_write_timeout_ms() -> u64 {
    1000
}

/// Terminal-device injection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Command names treated as the target's interactive process
    #[serde(default = "default_shell_names")]
    pub shell_names: Vec<String>,

    /// Device written when no interactive process owns a terminal
    #[serde(default = "default_fallback_device")]
    pub fallback_device: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell_names: default_shell_names(),
            fallback_device: default_fallback_device(),
        }
    }
}

fn default_shell_names() -> Vec<String> {
    [
        "bash", "zsh", "sh", "fish", "dash", "ash", "claude", "node", "python", "python3",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_fallback_device() -> String {
    "/dev/pts/0".to_string()
}

/// Signal-triggered transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Signal sent to the target process (e.g. "SIGUSR1")
    #[serde(default = "default_signal")]
    pub signal: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            signal: default_signal(),
        }
    }
}

impl SignalConfig {
    /// Resolve the configured signal name.
    #[cfg(unix)]
    pub fn resolve(&self) -> BridgeResult<nix::sys::signal::Signal> {
        let name = if self.signal.starts_with("SIG") {
            self.signal.clone()
        } else {
            format!("SIG{}", self.signal)
        };
        nix::sys::signal::Signal::from_str(&name)
            .map_err(|e| BridgeError::Config(format!("Unknown signal {:?}: {}", self.signal, e)))
    }
}

fn default_signal() -> String {
    "SIGUSR1".to_string()
}

/// Ephemeral-exec transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Path, inside the target, that the rendered message is printed to
    #[serde(default = "default_exec_output_path")]
    pub output_path: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            output_path: default_exec_output_path(),
        }
    }
}

fn default_exec_output_path() -> String {
    "/proc/1/fd/1".to_string()
}

/// Container runtime client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker-compatible CLI binary
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// Upper bound on any single runtime CLI invocation
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Check that the target container is running before sending
    #[serde(default = "default_true")]
    pub verify_targets: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            command_timeout_ms: default_command_timeout_ms(),
            verify_targets: true,
        }
    }
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// Shared-storage polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Correlated request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Inbound event queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Capacity of the queue between listeners and handler dispatch
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration loader and manager
pub struct ConfigManager {
    config: BridgeConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults
    pub fn load(config_path: Option<&Path>) -> BridgeResult<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => {
                // Look for .parley/config.toml in home, then current dir
                let home_path = dirs::home_dir().map(|home| home.join(".parley/config.toml"));
                match home_path {
                    Some(p) if p.exists() => p,
                    _ => PathBuf::from(".parley/config.toml"),
                }
            }
        };

        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(&path)
                .map_err(|e| BridgeError::Config(format!("Failed to read config file: {}", e)))?;
            Self::parse(&content)?
        } else {
            warn!("Config file not found at {:?}, using defaults", path);
            BridgeConfig::default()
        };

        debug!("Configuration loaded successfully");
        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Parse a TOML document into a configuration.
    pub fn parse(content: &str) -> BridgeResult<BridgeConfig> {
        toml::from_str(content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Wrap an in-memory configuration.
    pub fn from_config(config: BridgeConfig) -> Self {
        Self {
            config,
            config_path: PathBuf::from(".parley/config.toml"),
        }
    }

    /// Get configuration reference
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Get mutable configuration reference
    pub fn config_mut(&mut self) -> &mut BridgeConfig {
        &mut self.config
    }

    /// Consume the manager, returning the configuration
    pub fn into_config(self) -> BridgeConfig {
        self.config
    }

    /// Validate configuration
    pub fn validate(&self) -> BridgeResult<()> {
        let config = &self.config;

        if config.identity.trim().is_empty() {
            return Err(BridgeError::Config("Identity must not be empty".to_string()));
        }

        if config.retry.attempts == 0 {
            return Err(BridgeError::Config(
                "Retry attempts must be greater than 0".to_string(),
            ));
        }

        if config.polling.interval_ms == 0 {
            return Err(BridgeError::Config(
                "Polling interval must be greater than 0".to_string(),
            ));
        }

        if config.pipe.open_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "Pipe open timeout must be greater than 0".to_string(),
            ));
        }

        if config.terminal.shell_names.is_empty() {
            return Err(BridgeError::Config(
                "Terminal shell allow-list must not be empty".to_string(),
            ));
        }

        if config.events.queue_capacity == 0 {
            return Err(BridgeError::Config(
                "Event queue capacity must be greater than 0".to_string(),
            ));
        }

        #[cfg(unix)]
        config.signal.resolve()?;

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Load configuration overrides from environment variables
    pub fn load_from_env(&mut self) -> BridgeResult<()> {
        if let Ok(identity) = std::env::var("PARLEY_IDENTITY") {
            self.config.identity = identity;
        }

        if let Ok(root) = std::env::var("PARLEY_SHARED_ROOT") {
            self.config.shared_root = PathBuf::from(root);
        }

        if let Ok(binary) = std::env::var("PARLEY_RUNTIME") {
            self.config.runtime.binary = binary;
        }

        if let Ok(level) = std::env::var("PARLEY_LOG_LEVEL") {
            self.config.logging.level = level;
        }

        info!("Configuration loaded from environment variables");
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
