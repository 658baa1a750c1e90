//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress log output, including errors
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

/// Tracing configuration for debugging
#[derive(Debug, Default, Clone)]
pub struct TracingConfig {
    /// Debug log file path, receives DEBUG and above regardless of verbosity
    pub debug_log_file: Option<String>,
    /// Name of the root span every log line is reported under (e.g. "bcast")
    pub trace_identifier: String,
    /// Rank recorded on the root span
    pub rank: usize,
}

/// Default chunk capacity: 1 GiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 30;

/// Settings of the streaming pipeline
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Capacity of the chunk buffer (bytes), one allocation per process
    pub chunk_size: u64,
    /// Skip extraction on the coordinator
    pub no_root_write: bool,
    /// Archiver program used to serialize and extract the tree
    pub tar: std::path::PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            no_root_write: false,
            tar: std::path::PathBuf::from("tar"),
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if usize::try_from(self.chunk_size).is_err() {
            return Err(format!(
                "chunk_size {} does not fit in memory on this platform",
                self.chunk_size
            ));
        }
        if self.tar.as_os_str().is_empty() {
            return Err("archiver program must not be empty".to_string());
        }
        Ok(())
    }
}

/// Default port used when the coordinator is derived from the PBS node file
pub const DEFAULT_COORDINATOR_PORT: u16 = 29517;

/// How the process group is formed
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Address of rank 0 (HOST:PORT), required for groups larger than one
    pub coordinator: Option<String>,
    /// IP address the coordinator binds its listener to (default: all interfaces)
    pub bind_ip: Option<std::net::IpAddr>,
    /// Upper bound on group formation
    pub connect_timeout: std::time::Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            coordinator: None,
            bind_ip: None,
            connect_timeout: std::time::Duration::from_secs(60),
        }
    }
}
