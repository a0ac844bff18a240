//! Server and per-pipe configuration
//!
//! [`ServerConfiguration`] holds process-wide tunables and can be loaded
//! from `MPIPE_*` environment variables or a YAML file.
//! [`MessagePipeConfiguration`] is the immutable policy a pipe is created
//! with.
//!
//! # Environment Variables
//!
//! - `MPIPE_SERVER_PORT`: RPC listen port (default: 8089)
//! - `MPIPE_EXPIRED_EXCLUDE_THRESHOLD_SECS`: heartbeat silence before a client goes OFFLINE (default: 30)
//! - `MPIPE_EXPIRE_CHECK_INTERVAL_SECS`: expiry sweep period (default: 5)
//! - `MPIPE_MAX_PIPE_COUNT`: ceiling on live pipes (default: 1024)
//! - `MPIPE_PIPE_IDLE_THRESHOLD_SECS`: idle time before a pipe is reaped (default: 300)
//! - `MPIPE_REAPER_INTERVAL_SECS`: reaper period (default: 60)
//! - `MPIPE_EXCLUDE_PIPE_PATTERNS`: comma separated regexes of names never served
//! - `MPIPE_WORKER_POOL_SIZE`: concurrent RPC handlers (default: 16)
//! - `MPIPE_METRICS_REPORT_INTERVAL_SECS`: cluster report period (default: 60)
//! - `MPIPE_RETRY_RECORD_TTL_SECS`: silence after which a local retry record is dropped (default: 3600)
//! - `MPIPE_REDIS_URL`: Redis store URL; in-memory store when unset

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::discovery::LoadBalanceStrategy;
use crate::error::{BrokerError, BrokerResult};
use crate::exception::{ExceptionHandler, LoggingExceptionHandler};
use crate::message::{JsonCodec, MessageCodec, RequestIdGenerator, UuidRequestIdGenerator};

/// Queue-depth and idle-time limits used to bucket pipe health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsThresholds {
    pub caution_queue_size: usize,
    pub warning_queue_size: usize,
    pub critical_queue_size: usize,
    /// Idle time with a backlog that raises a pipe to warning
    pub warning_idle_secs: u64,
    /// Idle time with a backlog that raises a pipe to critical
    pub critical_idle_secs: u64,
    /// Idle time with a backlog after which a pipe is stalled
    pub stalled_idle_secs: u64,
    /// Entries in each top-N section of the report
    pub report_top_n: usize,
}

impl Default for MetricsThresholds {
    fn default() -> Self {
        Self {
            caution_queue_size: 100,
            warning_queue_size: 1_000,
            critical_queue_size: 10_000,
            warning_idle_secs: 60,
            critical_idle_secs: 180,
            stalled_idle_secs: 300,
            report_top_n: 10,
        }
    }
}

/// Process-wide tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfiguration {
    pub server_port: u16,
    pub expired_exclude_threshold_secs: u64,
    pub expire_check_interval_secs: u64,
    pub max_pipe_count: usize,
    pub pipe_idle_threshold_secs: u64,
    pub reaper_interval_secs: u64,
    /// Pipe names fully matching any of these regexes are never created
    pub exclude_pipe_patterns: Vec<String>,
    pub worker_pool_size: usize,
    pub metrics_report_interval_secs: u64,
    /// Retry records untouched this long are swept by the reaper
    pub retry_record_ttl_secs: u64,
    pub redis_url: Option<String>,
    pub metrics: MetricsThresholds,
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self {
            server_port: 8089,
            expired_exclude_threshold_secs: 30,
            expire_check_interval_secs: 5,
            max_pipe_count: 1024,
            pipe_idle_threshold_secs: 300,
            reaper_interval_secs: 60,
            exclude_pipe_patterns: Vec::new(),
            worker_pool_size: 16,
            metrics_report_interval_secs: 60,
            retry_record_ttl_secs: 3600,
            redis_url: None,
            metrics: MetricsThresholds::default(),
        }
    }
}

impl ServerConfiguration {
    /// Load defaults overridden by `MPIPE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Configuration` if a variable has an invalid
    /// value or the result fails validation.
    pub fn from_env() -> BrokerResult<Self> {
        let mut config = Self::default();

        if let Some(port) = get_env_u16("MPIPE_SERVER_PORT")? {
            config.server_port = port;
        }
        if let Some(secs) = get_env_u64("MPIPE_EXPIRED_EXCLUDE_THRESHOLD_SECS")? {
            config.expired_exclude_threshold_secs = secs;
        }
        if let Some(secs) = get_env_u64("MPIPE_EXPIRE_CHECK_INTERVAL_SECS")? {
            config.expire_check_interval_secs = secs;
        }
        if let Some(max) = get_env_usize("MPIPE_MAX_PIPE_COUNT")? {
            config.max_pipe_count = max;
        }
        if let Some(secs) = get_env_u64("MPIPE_PIPE_IDLE_THRESHOLD_SECS")? {
            config.pipe_idle_threshold_secs = secs;
        }
        if let Some(secs) = get_env_u64("MPIPE_REAPER_INTERVAL_SECS")? {
            config.reaper_interval_secs = secs;
        }
        if let Some(patterns) = get_env_string("MPIPE_EXCLUDE_PIPE_PATTERNS") {
            config.exclude_pipe_patterns = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(size) = get_env_usize("MPIPE_WORKER_POOL_SIZE")? {
            config.worker_pool_size = size;
        }
        if let Some(secs) = get_env_u64("MPIPE_METRICS_REPORT_INTERVAL_SECS")? {
            config.metrics_report_interval_secs = secs;
        }
        if let Some(secs) = get_env_u64("MPIPE_RETRY_RECORD_TTL_SECS")? {
            config.retry_record_ttl_secs = secs;
        }
        if let Some(url) = get_env_string("MPIPE_REDIS_URL") {
            config.redis_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file; absent fields keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse YAML text; absent fields keep their defaults
    pub fn from_yaml_str(raw: &str) -> BrokerResult<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| BrokerError::Configuration(format!("invalid yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.server_port == 0 {
            return Err(BrokerError::Configuration(
                "server_port must be greater than 0".to_string(),
            ));
        }
        if self.max_pipe_count == 0 {
            return Err(BrokerError::Configuration(
                "max_pipe_count must be greater than 0".to_string(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(BrokerError::Configuration(
                "worker_pool_size must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            (
                "expired_exclude_threshold_secs",
                self.expired_exclude_threshold_secs,
            ),
            ("expire_check_interval_secs", self.expire_check_interval_secs),
            ("pipe_idle_threshold_secs", self.pipe_idle_threshold_secs),
            ("reaper_interval_secs", self.reaper_interval_secs),
            (
                "metrics_report_interval_secs",
                self.metrics_report_interval_secs,
            ),
            ("retry_record_ttl_secs", self.retry_record_ttl_secs),
        ] {
            if value == 0 {
                return Err(BrokerError::Configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        let m = &self.metrics;
        if !(m.caution_queue_size <= m.warning_queue_size
            && m.warning_queue_size <= m.critical_queue_size)
        {
            return Err(BrokerError::Configuration(
                "metrics queue-size thresholds must be ascending".to_string(),
            ));
        }
        if !(m.warning_idle_secs <= m.critical_idle_secs
            && m.critical_idle_secs <= m.stalled_idle_secs)
        {
            return Err(BrokerError::Configuration(
                "metrics idle thresholds must be ascending".to_string(),
            ));
        }

        self.compiled_exclude_patterns()?;
        Ok(())
    }

    /// Exclusion patterns compiled as full-match regexes
    pub fn compiled_exclude_patterns(&self) -> BrokerResult<Vec<Regex>> {
        self.exclude_pipe_patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{})$", p)).map_err(BrokerError::from))
            .collect()
    }

    pub fn expired_exclude_threshold(&self) -> Duration {
        Duration::from_secs(self.expired_exclude_threshold_secs)
    }

    pub fn expire_check_interval(&self) -> Duration {
        Duration::from_secs(self.expire_check_interval_secs)
    }

    pub fn pipe_idle_threshold(&self) -> Duration {
        Duration::from_secs(self.pipe_idle_threshold_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn retry_record_ttl(&self) -> Duration {
        Duration::from_secs(self.retry_record_ttl_secs)
    }

    pub fn metrics_report_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_report_interval_secs)
    }
}

/// Immutable per-pipe policy
#[derive(Clone)]
pub struct MessagePipeConfiguration {
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    /// How long an idle worker sleeps before re-checking
    pub monitor_interval: Duration,
    pub request_timeout: Duration,
    pub dlq_ttl: Duration,
    /// Messages shipped per consumer call
    pub batch_size: usize,
    pub max_retries: u32,
    pub exception_handler: Arc<dyn ExceptionHandler>,
    /// Overrides the registry's own strategy for this pipe
    pub load_balance: Option<Arc<dyn LoadBalanceStrategy>>,
    pub request_id_generator: Arc<dyn RequestIdGenerator>,
    pub codec: Arc<dyn MessageCodec>,
}

impl fmt::Debug for MessagePipeConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipeConfiguration")
            .field("lock_wait", &self.lock_wait)
            .field("lock_lease", &self.lock_lease)
            .field("monitor_interval", &self.monitor_interval)
            .field("request_timeout", &self.request_timeout)
            .field("dlq_ttl", &self.dlq_ttl)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Default for MessagePipeConfiguration {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(3),
            lock_lease: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            dlq_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            batch_size: 100,
            max_retries: 3,
            exception_handler: Arc::new(LoggingExceptionHandler::default()),
            load_balance: None,
            request_id_generator: Arc::new(UuidRequestIdGenerator),
            codec: Arc::new(JsonCodec),
        }
    }
}

impl MessagePipeConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_dlq_ttl(mut self, ttl: Duration) -> Self {
        self.dlq_ttl = ttl;
        self
    }

    /// Set the batch size (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn with_load_balance(mut self, strategy: Arc<dyn LoadBalanceStrategy>) -> Self {
        self.load_balance = Some(strategy);
        self
    }

    pub fn with_request_id_generator(mut self, generator: Arc<dyn RequestIdGenerator>) -> Self {
        self.request_id_generator = generator;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }
}

// Environment variable helper functions

fn get_env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn invalid_env(key: &str, message: String) -> BrokerError {
    BrokerError::Configuration(format!(
        "Invalid environment variable '{}': {}",
        key, message
    ))
}

fn get_env_u16(key: &str) -> BrokerResult<Option<u16>> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u16>()
            .map(Some)
            .map_err(|e| invalid_env(key, format!("invalid u16 value '{val}': {e}"))),
        Err(_) => Ok(None),
    }
}

fn get_env_u64(key: &str) -> BrokerResult<Option<u64>> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Some)
            .map_err(|e| invalid_env(key, format!("invalid u64 value '{val}': {e}"))),
        Err(_) => Ok(None),
    }
}

fn get_env_usize(key: &str) -> BrokerResult<Option<usize>> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| invalid_env(key, format!("invalid usize value '{val}': {e}"))),
        Err(_) => Ok(None),
    }
}
