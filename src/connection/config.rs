use crate::core::{DEFAULT_TIMEOUT, TxTimeout};

/// Session engine configuration
///
/// Builder-style, validated once at bootstrap.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of dedicated workers sessions are spread over
    pub worker_count: usize,

    /// Thread name prefix for workers
    pub worker_name_prefix: String,

    /// Timeout applied when a caller or definition does not specify one
    pub default_timeout: TxTimeout,

    /// Simulated round-trip latency of the in-memory driver
    pub driver_latency: Option<std::time::Duration>,
}

impl SessionConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            worker_count,
            worker_name_prefix: "txsession-worker".to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            driver_latency: None,
        }
    }

    /// Set the number of workers
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the worker thread name prefix
    pub fn worker_name_prefix(mut self, prefix: &str) -> Self {
        self.worker_name_prefix = prefix.to_string();
        self
    }

    /// Set the default transaction timeout
    pub fn default_timeout(mut self, timeout: TxTimeout) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set simulated driver latency
    pub fn driver_latency(mut self, latency: std::time::Duration) -> Self {
        self.driver_latency = Some(latency);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be > 0".to_string());
        }

        if self.worker_name_prefix.trim().is_empty() {
            return Err("worker_name_prefix cannot be empty".to_string());
        }

        if self.default_timeout == TxTimeout::Bounded(std::time::Duration::ZERO) {
            return Err("default_timeout must be unbounded or > 0".to_string());
        }

        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
