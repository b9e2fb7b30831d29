//! Backplane configuration
//!
//! Every setting has a default; `BackplaneConfig::from_env` overrides them from
//! `BACKPLANE_*` environment variables (plus `DATABASE_URL`).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which messages the cleaner considers for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStrategy {
    /// Never delete anything
    None,
    /// Delete once every active subscriber has acknowledged
    AckBased,
    /// Delete once older than the retention time
    TtlBased,
    /// Union of `AckBased` and `TtlBased`
    AckOrTtlBased,
}

impl CleanupStrategy {
    pub fn ack_enabled(self) -> bool {
        matches!(self, CleanupStrategy::AckBased | CleanupStrategy::AckOrTtlBased)
    }

    pub fn ttl_enabled(self) -> bool {
        matches!(self, CleanupStrategy::TtlBased | CleanupStrategy::AckOrTtlBased)
    }
}

impl FromStr for CleanupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(CleanupStrategy::None),
            "ackbased" | "ack" => Ok(CleanupStrategy::AckBased),
            "ttlbased" | "ttl" => Ok(CleanupStrategy::TtlBased),
            "ackorttlbased" | "ackorttl" => Ok(CleanupStrategy::AckOrTtlBased),
            other => Err(format!("Unknown cleanup strategy: {}", other)),
        }
    }
}

/// How the cleaner removes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Flag the row as deleted and keep it for audit
    Logical,
    /// Remove the row and its acknowledgments
    Physical,
}

impl FromStr for CleanupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logical" => Ok(CleanupMode::Logical),
            "physical" => Ok(CleanupMode::Physical),
            other => Err(format!("Unknown cleanup mode: {}", other)),
        }
    }
}

/// Backplane configuration
#[derive(Clone)]
pub struct BackplaneConfig {
    /// Identity of this process in the subscribers table.
    ///
    /// Two stores sharing an id are treated as instances of the same
    /// subscriber: an acknowledgment from one counts for both.
    pub subscriber_id: String,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum number of pooled connections
    pub max_connections: u32,
    /// Connection creation timeout
    pub connect_timeout: Duration,
    /// Delay between two subscribe polls
    pub poll_interval: Duration,
    /// Maximum number of messages fetched per subscribe poll
    pub poll_batch_size: i64,
    /// Provision the schema on construction
    pub auto_create_schema: bool,
    pub heartbeat_interval: Duration,
    /// Subscribers silent for longer than this are ignored by the ack quorum
    pub heartbeat_timeout: Duration,
    pub cleanup_strategy: CleanupStrategy,
    pub cleanup_mode: CleanupMode,
    pub cleanup_interval: Duration,
    /// Page size for candidate scans and deletion batches
    pub cleanup_batch_size: i64,
    /// Age after which a message is reclaimed regardless of acknowledgments
    pub retention_time: Duration,
    /// Register every local client connection as a subscriber on connect.
    ///
    /// Connection rows are written once and never refreshed, and messages
    /// are only ever acked under the process id. A connection subscriber
    /// therefore never completes an ack quorum: it holds ack-based cleanup
    /// back until it ages past `heartbeat_timeout`, after which TTL or the
    /// remaining subscribers decide.
    pub register_connections: bool,
}

impl fmt::Debug for BackplaneConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackplaneConfig")
            .field("subscriber_id", &self.subscriber_id)
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("poll_batch_size", &self.poll_batch_size)
            .field("auto_create_schema", &self.auto_create_schema)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("cleanup_strategy", &self.cleanup_strategy)
            .field("cleanup_mode", &self.cleanup_mode)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("cleanup_batch_size", &self.cleanup_batch_size)
            .field("retention_time", &self.retention_time)
            .field("register_connections", &self.register_connections)
            .finish()
    }
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            subscriber_id: default_subscriber_id(),
            database_url: String::from("postgres://localhost/backplane"),
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            poll_batch_size: 500,
            auto_create_schema: true,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            cleanup_strategy: CleanupStrategy::AckOrTtlBased,
            cleanup_mode: CleanupMode::Logical,
            cleanup_interval: Duration::from_secs(5 * 60),
            cleanup_batch_size: 500,
            retention_time: Duration::from_secs(7 * 24 * 60 * 60),
            register_connections: false,
        }
    }
}

impl BackplaneConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything missing or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            subscriber_id: std::env::var("BACKPLANE_SUBSCRIBER_ID")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.subscriber_id),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse_env_with_default(
                "BACKPLANE_DB_MAX_CONNECTIONS",
                defaults.max_connections,
            ),
            connect_timeout: secs_env("BACKPLANE_DB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            poll_interval: millis_env("BACKPLANE_POLL_INTERVAL_MS", defaults.poll_interval),
            poll_batch_size: parse_env_with_default(
                "BACKPLANE_POLL_BATCH_SIZE",
                defaults.poll_batch_size,
            ),
            auto_create_schema: parse_env_with_default(
                "BACKPLANE_AUTO_CREATE_SCHEMA",
                defaults.auto_create_schema,
            ),
            heartbeat_interval: secs_env(
                "BACKPLANE_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: secs_env(
                "BACKPLANE_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            cleanup_strategy: parse_env_with_default(
                "BACKPLANE_CLEANUP_STRATEGY",
                defaults.cleanup_strategy,
            ),
            cleanup_mode: parse_env_with_default("BACKPLANE_CLEANUP_MODE", defaults.cleanup_mode),
            cleanup_interval: secs_env(
                "BACKPLANE_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval,
            ),
            cleanup_batch_size: parse_env_with_default(
                "BACKPLANE_CLEANUP_BATCH_SIZE",
                defaults.cleanup_batch_size,
            ),
            retention_time: secs_env("BACKPLANE_RETENTION_SECS", defaults.retention_time),
            register_connections: parse_env_with_default(
                "BACKPLANE_REGISTER_CONNECTIONS",
                defaults.register_connections,
            ),
        }
    }

    pub fn with_subscriber_id(mut self, subscriber_id: impl Into<String>) -> Self {
        self.subscriber_id = subscriber_id.into();
        self
    }

    pub fn with_database_url(mut self, database_url: impl Into<String>) -> Self {
        self.database_url = database_url.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_cleanup(mut self, strategy: CleanupStrategy, mode: CleanupMode) -> Self {
        self.cleanup_strategy = strategy;
        self.cleanup_mode = mode;
        self
    }

    pub fn with_retention_time(mut self, retention_time: Duration) -> Self {
        self.retention_time = retention_time;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Log configuration details
    pub fn log_config(&self) {
        tracing::info!(
            subscriber_id = %self.subscriber_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            heartbeat_timeout_secs = self.heartbeat_timeout.as_secs(),
            cleanup_strategy = ?self.cleanup_strategy,
            cleanup_mode = ?self.cleanup_mode,
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            retention_secs = self.retention_time.as_secs(),
            "Backplane configuration"
        );
    }
}

fn default_subscriber_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("backplane-{}", uuid::Uuid::new_v4()))
}

/// Parse an environment variable with a default fallback
fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn millis_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
