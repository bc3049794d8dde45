//! Configuration system for Lobby.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LOBBY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lobby/config.toml
//!   3. ~/.config/lobby/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    pub network: NetworkConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub invite: InviteConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Public listener for the WebSocket endpoint.
    pub listen_addr: String,
    /// Admin API port, bound on 127.0.0.1.
    pub api_port: u16,
    /// Host name handed to clients in `session_granted`.
    pub public_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ceiling on active + waiting clients.
    pub max_size: usize,
    /// A client silent for longer than this is removed.
    pub heartbeat_grace_secs: u64,
    /// How often the sweep runs.
    pub sweep_interval_ms: u64,
    /// Per-client outbound event buffer. Overflow drops events.
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard cap on one client's turn.
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enqueue attempts per origin per window.
    pub connect_ceiling: u32,
    pub connect_window_secs: u64,
    /// Invite validations per origin per window.
    pub invite_ceiling: u32,
    pub invite_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteConfig {
    /// 64 hex characters. Empty = random key per run.
    pub secret_hex: String,
    pub default_ttl_secs: u64,
    /// Bearer token required by the admin API. Empty = no check.
    pub admin_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Program started per session. Arguments may use `{session_id}`,
    /// `{port}`, `{memory_bytes}`, `{memory_mb}`, `{cpu_millis}`, `{cpus}`, `{max_pids}`.
    pub program: String,
    pub args: Vec<String>,
    /// Optional command run after the process group is killed
    /// (container/volume removal). Same placeholders.
    pub cleanup_program: String,
    pub cleanup_args: Vec<String>,
    pub memory_bytes: u64,
    /// CPU quota in thousandths of a core.
    pub cpu_millis: u32,
    pub max_pids: u32,
    /// Spawns slower than this count as failures.
    pub spawn_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            api_port: 9011,
            public_host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            heartbeat_grace_secs: 30,
            sweep_interval_ms: 1_000,
            outbound_buffer: 32,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 60 * 60,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connect_ceiling: 20,
            connect_window_secs: 60,
            invite_ceiling: 5,
            invite_window_secs: 300,
        }
    }
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            secret_hex: String::new(),
            default_ttl_secs: 24 * 60 * 60,
            admin_token: String::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            args: [
                "run",
                "--rm",
                "--name",
                "lobby-{session_id}",
                "--memory",
                "{memory_bytes}",
                "--cpus",
                "{cpus}",
                "--pids-limit",
                "{max_pids}",
                "--security-opt",
                "no-new-privileges",
                "--cap-drop",
                "ALL",
                "-p",
                "{port}:7681",
                "lobby-demo:latest",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            cleanup_program: "docker".to_string(),
            cleanup_args: vec![
                "rm".to_string(),
                "-f".to_string(),
                "-v".to_string(),
                "lobby-{session_id}".to_string(),
            ],
            memory_bytes: 512 * 1024 * 1024,
            cpu_millis: 1_000,
            max_pids: 256,
            spawn_timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }
}

impl SessionConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("lobby")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LobbyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            LobbyConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOBBY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LobbyConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_size == 0 {
            return Err(ConfigError::Invalid("queue.max_size must be at least 1".into()));
        }
        if self.session.max_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.max_duration_secs must be at least 1".into(),
            ));
        }
        if self.rate_limit.connect_window_secs == 0 || self.rate_limit.invite_window_secs == 0 {
            return Err(ConfigError::Invalid("rate-limit windows must be non-zero".into()));
        }
        if !self.invite.secret_hex.is_empty() && self.invite.secret_hex.len() != 64 {
            return Err(ConfigError::Invalid(
                "invite.secret_hex must be 64 hex characters".into(),
            ));
        }
        if self.sandbox.program.is_empty() {
            return Err(ConfigError::Invalid("sandbox.program must be set".into()));
        }
        Ok(())
    }

    /// Apply LOBBY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LOBBY_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("LOBBY_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("LOBBY_NETWORK__PUBLIC_HOST") {
            self.network.public_host = v;
        }
        if let Ok(v) = std::env::var("LOBBY_QUEUE__MAX_SIZE") {
            if let Ok(n) = v.parse() {
                self.queue.max_size = n;
            }
        }
        if let Ok(v) = std::env::var("LOBBY_SESSION__MAX_DURATION_SECS") {
            if let Ok(n) = v.parse() {
                self.session.max_duration_secs = n;
            }
        }
        if let Ok(v) = std::env::var("LOBBY_INVITE__SECRET_HEX") {
            self.invite.secret_hex = v;
        }
        if let Ok(v) = std::env::var("LOBBY_INVITE__ADMIN_TOKEN") {
            self.invite.admin_token = v;
        }
        if let Ok(v) = std::env::var("LOBBY_SANDBOX__PROGRAM") {
            self.sandbox.program = v;
        }
    }
}
