//! Session manager configuration.
//!
//! Loaded in order: defaults, `PEERLINK_*` environment variables, the TOML
//! file named by `PEERLINK_CONFIG`, then validated. Running components read
//! the current value through a [`ConfigHandle`], which also carries updates.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use peerlink_crypto::protocol::MIN_MESSAGE_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How certificate revocation is enforced during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevocationCheckMode {
    Off,
    /// Unreachable revocation sources do not fail the check.
    SoftFail,
    /// Any doubt about revocation fails the check.
    HardFail,
}

impl std::str::FromStr for RevocationCheckMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFF" => Ok(Self::Off),
            "SOFT_FAIL" => Ok(Self::SoftFail),
            "HARD_FAIL" => Ok(Self::HardFail),
            other => Err(ConfigError::Invalid(format!("unknown revocation_check_mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    pub max_message_size: u32,
    pub sessions_per_peer_for_members: usize,
    pub sessions_per_peer_for_mgm: usize,
    pub revocation_check_mode: RevocationCheckMode,
    /// Lifetime of an established session's persisted state.
    pub session_refresh_threshold_secs: u64,
    /// Time without an ack after which a session is declared dead.
    pub session_inactivity_limit_secs: u64,
    pub revocation_check_timeout_secs: u64,
    pub session_cache_capacity: usize,
    /// Lifetime of a pending negotiation's persisted state.
    pub pending_session_ttl_secs: u64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1_000_000,
            sessions_per_peer_for_members: 1,
            sessions_per_peer_for_mgm: 1,
            revocation_check_mode: RevocationCheckMode::Off,
            session_refresh_threshold_secs: 432_000, // 5 days
            session_inactivity_limit_secs: 60,
            revocation_check_timeout_secs: 60,
            session_cache_capacity: 10_000,
            pending_session_ttl_secs: 3600,
        }
    }
}

impl SessionManagerConfig {
    /// Load configuration from environment variables and the TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.apply_env_overrides(|name| std::env::var(name).ok())?;

        if let Ok(config_path) = std::env::var("PEERLINK_CONFIG") {
            config = Self::from_toml_file(config_path)?;
            config.apply_env_overrides(|name| std::env::var(name).ok())?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `PEERLINK_*` overrides found through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("Invalid {}: {}", name, value)))
        }

        if let Some(v) = lookup("PEERLINK_MAX_MESSAGE_SIZE") {
            self.max_message_size = parse("PEERLINK_MAX_MESSAGE_SIZE", v)?;
        }
        if let Some(v) = lookup("PEERLINK_SESSIONS_PER_PEER_FOR_MEMBERS") {
            self.sessions_per_peer_for_members = parse("PEERLINK_SESSIONS_PER_PEER_FOR_MEMBERS", v)?;
        }
        if let Some(v) = lookup("PEERLINK_SESSIONS_PER_PEER_FOR_MGM") {
            self.sessions_per_peer_for_mgm = parse("PEERLINK_SESSIONS_PER_PEER_FOR_MGM", v)?;
        }
        if let Some(v) = lookup("PEERLINK_REVOCATION_CHECK_MODE") {
            self.revocation_check_mode = v.parse()?;
        }
        if let Some(v) = lookup("PEERLINK_SESSION_REFRESH_THRESHOLD_SECS") {
            self.session_refresh_threshold_secs = parse("PEERLINK_SESSION_REFRESH_THRESHOLD_SECS", v)?;
        }
        if let Some(v) = lookup("PEERLINK_SESSION_INACTIVITY_LIMIT_SECS") {
            self.session_inactivity_limit_secs = parse("PEERLINK_SESSION_INACTIVITY_LIMIT_SECS", v)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be >= {}",
                MIN_MESSAGE_SIZE
            )));
        }
        if self.sessions_per_peer_for_members == 0 || self.sessions_per_peer_for_mgm == 0 {
            return Err(ConfigError::Invalid("sessions per peer must be > 0".to_string()));
        }
        if self.session_inactivity_limit_secs == 0 {
            return Err(ConfigError::Invalid("session_inactivity_limit_secs must be > 0".to_string()));
        }
        if self.session_refresh_threshold_secs == 0 || self.pending_session_ttl_secs == 0 {
            return Err(ConfigError::Invalid("state lifetimes must be > 0".to_string()));
        }
        if self.revocation_check_timeout_secs == 0 {
            return Err(ConfigError::Invalid("revocation_check_timeout_secs must be > 0".to_string()));
        }
        if self.session_cache_capacity == 0 {
            return Err(ConfigError::Invalid("session_cache_capacity must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn sessions_per_peer(&self, counterparty_is_mgm: bool) -> usize {
        if counterparty_is_mgm {
            self.sessions_per_peer_for_mgm
        } else {
            self.sessions_per_peer_for_members
        }
    }

    pub fn session_refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.session_refresh_threshold_secs)
    }

    pub fn session_inactivity_limit(&self) -> Duration {
        Duration::from_secs(self.session_inactivity_limit_secs)
    }

    pub fn revocation_check_timeout(&self) -> Duration {
        Duration::from_secs(self.revocation_check_timeout_secs)
    }

    pub fn pending_session_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_session_ttl_secs)
    }
}

/// Shared, hot-reloadable configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<SessionManagerConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: SessionManagerConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<SessionManagerConfig> {
        self.tx.borrow().clone()
    }

    /// Publish a new configuration to every subscriber.
    pub fn update(&self, config: SessionManagerConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionManagerConfig>> {
        self.tx.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(SessionManagerConfig::default())
    }
}
