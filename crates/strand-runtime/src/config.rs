//! Runtime configuration
//!
//! Compile-time defaults with runtime overrides, highest priority first:
//!
//! 1. Builder methods (programmatic)
//! 2. YAML file/string ingestion
//! 3. `STRAND_*` environment variables
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .workers(8)
//!     .name("edge-proxy");
//! config.validate().unwrap();
//! ```

use serde::{Deserialize, Serialize};
use strand_core::env::{env_get, env_get_bool, env_get_str};

/// Library defaults
pub mod defaults {
    /// Worker threads
    pub const WORKERS: usize = 4;
    /// Caller-thread participation
    pub const USE_CALLER: bool = false;
    /// Scheduler name
    pub const NAME: &str = "strand";
    /// Coroutine stack size
    pub const STACK_SIZE: usize = 128 * 1024;
    /// Reactor event-array bound
    pub const MAX_EVENTS: usize = 1024;
    /// Initial fd-context table capacity
    pub const FD_SLOTS: usize = 128;
}

/// Runtime configuration with builder-style setters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of logical workers (the participating caller counts as one)
    pub workers: usize,
    /// Whether the constructing thread drives the dispatch loop itself
    pub use_caller: bool,
    /// Name used for worker/reactor threads and log lines
    pub name: String,
    /// Private stack size per coroutine
    pub stack_size: usize,
    /// Upper bound of events returned by one multiplexer wait
    pub max_events: usize,
    /// Initial capacity of the fd-context table (grows by doubling)
    pub fd_slots: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Library defaults with environment overrides applied.
    ///
    /// Environment variables (all optional):
    /// - `STRAND_WORKERS` - worker thread count
    /// - `STRAND_USE_CALLER` - caller participation (0/1)
    /// - `STRAND_NAME` - scheduler name
    /// - `STRAND_STACK_SIZE` - coroutine stack bytes
    /// - `STRAND_MAX_EVENTS` - reactor event-array bound
    /// - `STRAND_FD_SLOTS` - initial fd-context capacity
    pub fn from_env() -> Self {
        RuntimeConfig {
            workers: env_get("STRAND_WORKERS", defaults::WORKERS),
            use_caller: env_get_bool("STRAND_USE_CALLER", defaults::USE_CALLER),
            name: env_get_str("STRAND_NAME", defaults::NAME),
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            max_events: env_get("STRAND_MAX_EVENTS", defaults::MAX_EVENTS),
            fd_slots: env_get("STRAND_FD_SLOTS", defaults::FD_SLOTS),
        }
    }

    /// Library defaults with no environment override (tests, full control)
    pub fn new() -> Self {
        RuntimeConfig {
            workers: defaults::WORKERS,
            use_caller: defaults::USE_CALLER,
            name: defaults::NAME.to_string(),
            stack_size: defaults::STACK_SIZE,
            max_events: defaults::MAX_EVENTS,
            fd_slots: defaults::FD_SLOTS,
        }
    }

    /// Parse a YAML document over env-seeded defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a YAML file over env-seeded defaults
    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml_str(&text)
    }

    // Builder methods

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn use_caller(mut self, enable: bool) -> Self {
        self.use_caller = enable;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn fd_slots(mut self, n: usize) -> Self {
        self.fd_slots = n;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue("workers must be > 0"));
        }
        if self.workers > 256 {
            return Err(ConfigError::InvalidValue("workers must be <= 256"));
        }
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue("name must not be empty"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.fd_slots == 0 {
            return Err(ConfigError::InvalidValue("fd_slots must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
    Parse(String),
    Io(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Io(msg) => write!(f, "config io error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
