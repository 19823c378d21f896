//! Runtime Configuration
//!
//! Configuration for the managed heap, the GC task pool and logging.
//! Values can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ARK_ALLOCATOR` | Allocator kind (`bump`/`region`/`large`) | region |
//! | `ARK_HEAP_SIZE` | Reserved heap size in bytes | 67108864 (64MB) |
//! | `ARK_REGION_SIZE` | Region size in bytes (power of two) | 262144 (256KB) |
//! | `ARK_LARGE_OBJECT_THRESHOLD` | Size at which objects go to large spans | 131072 (128KB) |
//! | `ARK_GC_THRESHOLD` | Allocated bytes that trigger a GC request (0 = never) | 50331648 (48MB) |
//! | `ARK_RETAINED_GARBAGE_REGIONS` | Garbage regions kept committed on partial reclaim | 8 |
//! | `ARK_TASKPOOL_THREADS` | Task pool worker count (0 = auto) | 0 |
//! | `ARK_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `arkEnableAsyncAllocation` | Async buffer replenishment (`0`/`1`) | platform |
//!
//! # Example
//!
//! ```rust,ignore
//! use ark_common::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .heap_size(128 * 1024 * 1024)
//!     .taskpool_threads(4)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

use crate::heap::allocator::AllocatorKind;
use crate::heap::PAGE_SIZE;

/// Environment variable controlling async allocation buffer replenishment.
pub const ASYNC_ALLOCATION_ENV: &str = "arkEnableAsyncAllocation";

/// Async allocation is on by default only on OpenHarmony targets.
pub const ASYNC_ALLOCATION_DEFAULT: bool = cfg!(target_env = "ohos");

/// Resolve the async allocation flag from a raw environment value.
///
/// Only the literals `"1"` and `"0"` are recognised. Anything else, including
/// an unset variable, yields [`ASYNC_ALLOCATION_DEFAULT`].
pub fn async_allocation_from_value(value: Option<&str>) -> bool {
    match value {
        Some("1") => true,
        Some("0") => false,
        _ => ASYNC_ALLOCATION_DEFAULT,
    }
}

/// Read the async allocation flag from the process environment.
pub fn async_allocation_from_env() -> bool {
    async_allocation_from_value(env::var(ASYNC_ALLOCATION_ENV).ok().as_deref())
}

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Heap configuration, consumed by `Allocator::init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Which allocator the runtime builds.
    pub allocator: AllocatorKind,

    /// Size of the reserved heap address range in bytes.
    /// Default: 64MB.
    pub heap_size: usize,

    /// Region size in bytes. Must be a power of two and at least one page.
    /// Default: 256KB.
    pub region_size: usize,

    /// Objects at least this large are served from dedicated spans.
    /// Default: half a region.
    pub large_object_threshold: usize,

    /// Allocated bytes above which the allocator requests a collection.
    /// 0 disables threshold-triggered requests.
    pub gc_threshold: usize,

    /// Garbage regions kept committed when reclaiming without `release_all`.
    pub retained_garbage_regions: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorKind::Region,
            heap_size: 64 * 1024 * 1024,           // 64 MB
            region_size: 256 * 1024,               // 256 KB
            large_object_threshold: 128 * 1024,    // 128 KB
            gc_threshold: 48 * 1024 * 1024,        // 48 MB
            retained_garbage_regions: 8,
        }
    }
}

impl HeapConfig {
    /// Number of regions the heap is divided into.
    pub fn region_count(&self) -> usize {
        self.heap_size / self.region_size
    }

    /// Validate the heap configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.region_size.is_power_of_two() || self.region_size < PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "heap.region_size".into(),
                message: format!("must be a power of two of at least {} bytes", PAGE_SIZE),
            });
        }

        if self.heap_size < self.region_size || self.heap_size % self.region_size != 0 {
            return Err(ConfigError::InvalidValue {
                field: "heap.heap_size".into(),
                message: "must be a non-zero multiple of region_size".into(),
            });
        }

        if self.large_object_threshold == 0 || self.large_object_threshold > self.region_size {
            return Err(ConfigError::InvalidValue {
                field: "heap.large_object_threshold".into(),
                message: "must be in 1..=region_size".into(),
            });
        }

        if self.gc_threshold > self.heap_size {
            return Err(ConfigError::InvalidValue {
                field: "heap.gc_threshold".into(),
                message: "must not exceed heap_size".into(),
            });
        }

        Ok(())
    }
}

/// Task pool configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskpoolConfig {
    /// Worker thread count; 0 picks a count from the CPU number.
    pub thread_num: u32,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include thread names in log output.
    /// Default: true.
    pub thread_names: bool,

    /// Include the event target (module path) in log output.
    /// Default: false (only in debug builds).
    pub targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            thread_names: true,
            targets: cfg!(debug_assertions),
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Heap configuration.
    pub heap: HeapConfig,

    /// Task pool configuration.
    pub taskpool: TaskpoolConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(kind) = env::var("ARK_ALLOCATOR").ok().and_then(|s| AllocatorKind::parse(&s)) {
            config.heap.allocator = kind;
        }

        if let Some(val) = parse_env_usize("ARK_HEAP_SIZE") {
            if val > 0 {
                config.heap.heap_size = val;
                config.heap.gc_threshold = config.heap.gc_threshold.min(val);
            }
        }

        if let Some(val) = parse_env_usize("ARK_REGION_SIZE") {
            if val.is_power_of_two() && val >= PAGE_SIZE {
                config.heap.region_size = val;
                config.heap.large_object_threshold = config.heap.large_object_threshold.min(val);
            }
        }

        if let Some(val) = parse_env_usize("ARK_LARGE_OBJECT_THRESHOLD") {
            if val > 0 {
                config.heap.large_object_threshold = val;
            }
        }

        if let Some(val) = parse_env_usize("ARK_GC_THRESHOLD") {
            config.heap.gc_threshold = val;
        }

        if let Some(val) = parse_env_usize("ARK_RETAINED_GARBAGE_REGIONS") {
            config.heap.retained_garbage_regions = val;
        }

        if let Some(val) = parse_env_usize("ARK_TASKPOOL_THREADS") {
            config.taskpool.thread_num = u32::try_from(val).unwrap_or(u32::MAX);
        }

        if let Ok(val) = env::var("ARK_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.heap.validate()
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the allocator kind.
    pub fn allocator(mut self, kind: AllocatorKind) -> Self {
        self.config.heap.allocator = kind;
        self
    }

    /// Set the reserved heap size in bytes.
    pub fn heap_size(mut self, size: usize) -> Self {
        self.config.heap.heap_size = size;
        self
    }

    /// Set the region size in bytes.
    pub fn region_size(mut self, size: usize) -> Self {
        self.config.heap.region_size = size;
        self
    }

    /// Set the large object threshold in bytes.
    pub fn large_object_threshold(mut self, size: usize) -> Self {
        self.config.heap.large_object_threshold = size;
        self
    }

    /// Set the GC request threshold in bytes (0 = never).
    pub fn gc_threshold(mut self, bytes: usize) -> Self {
        self.config.heap.gc_threshold = bytes;
        self
    }

    /// Set how many garbage regions survive a partial reclaim.
    pub fn retained_garbage_regions(mut self, count: usize) -> Self {
        self.config.heap.retained_garbage_regions = count;
        self
    }

    /// Set the task pool worker count (0 = auto).
    pub fn taskpool_threads(mut self, n: u32) -> Self {
        self.config.taskpool.thread_num = n;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}
