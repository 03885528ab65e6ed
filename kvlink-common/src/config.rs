//! # Client Configuration
//!
//! Purpose: Describe the target server and the tuning knobs of the transport
//! and pool in one serializable value owned by the caller.
//!
//! ## Design Principles
//! 1. **Explicit Ownership**: Configuration is passed at construction; nothing
//!    is kept in process-wide state.
//! 2. **Sane Defaults**: Every field has a default so partial JSON works.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KvError, KvResult};

/// Default connect and command timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
/// Default receive buffer size (2 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;
/// Default per-receive poll quantum in milliseconds.
pub const DEFAULT_POLL_QUANTUM_MS: u64 = 10;
/// Default maximum pool population.
pub const DEFAULT_POOL_MAX_LEN: usize = 8;

/// Connection and pool settings for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    pub port: u16,
    /// Password sent with AUTH after connecting; `None` skips AUTH.
    pub password: Option<String>,
    /// Connect timeout and cumulative command timeout.
    pub timeout_ms: u64,
    /// Capacity of the per-connection receive buffer.
    pub buffer_size: usize,
    /// Socket send/receive timeout; one unanswered receive advances the
    /// command wait by this much.
    pub poll_quantum_ms: u64,
    pub pool: PoolSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_quantum_ms: DEFAULT_POLL_QUANTUM_MS,
            pool: PoolSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for `host:port` with defaults elsewhere.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> KvResult<Self> {
        let config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> KvResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Rejects settings the transport cannot work with.
    pub fn validate(&self) -> KvResult<()> {
        if self.host.is_empty() {
            return Err(KvError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(KvError::Config("port must be non-zero".into()));
        }
        if self.buffer_size == 0 {
            return Err(KvError::Config("buffer_size must be non-zero".into()));
        }
        if self.poll_quantum_ms == 0 {
            return Err(KvError::Config("poll_quantum_ms must be non-zero".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[inline]
    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }

    /// Empty passwords are treated as "no password".
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|password| !password.is_empty())
    }
}

/// Tuning for the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of pooled entries.
    pub max_len: usize,
    /// Freshness window; an idle entry untouched for longer is replaced.
    /// Zero disables pooling entirely.
    pub idle_timeout_secs: u64,
    /// Reuses allowed before an entry is replaced.
    pub max_uses: u32,
    /// Sleep between acquisition attempts when the pool is exhausted.
    pub retry_interval_ms: u64,
    /// Total time acquisition keeps retrying before giving up.
    pub retry_window_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_len: DEFAULT_POOL_MAX_LEN,
            idle_timeout_secs: 60,
            max_uses: 100,
            retry_interval_ms: 10,
            retry_window_ms: 3000,
        }
    }
}

impl PoolSettings {
    /// `None` when pooling is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    #[inline]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    #[inline]
    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }
}
