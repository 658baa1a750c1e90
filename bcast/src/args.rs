use std::path::PathBuf;

use clap::Parser;

use crate::Error;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bcast",
    version,
    about = "Broadcast a directory tree to node-local storage of every process in a job",
    long_about = "`bcast` streams SOURCE as a tar archive from rank 0 to every rank of the job and \
extracts it into DESTINATION on each of them, holding at most one chunk in memory per process.
Arguments after DESTINATION are ignored.

Start one copy per process with the job launcher (mpiexec, srun, ...). Ranks are taken from the
launcher environment; BCAST_RANK / BCAST_WORLD_SIZE override them.

EXAMPLE:
    # copy the model weights to node-local scratch on every node
    mpiexec -n 64 --ppn 1 bcast --coordinator $(hostname):29517 /lus/models/llama /local/scratch"
)]
pub struct Args {
    // Transfer options
    /// Do not extract on rank 0
    ///
    /// Useful when rank 0 already has the data locally and only serves as the source.
    #[arg(long, help_heading = "Transfer options")]
    pub no_root_write: bool,

    /// Capacity of the chunk buffer, the upper bound on stream data held in memory per process
    ///
    /// This option accepts a human readable size, e.g. "64MiB", "1GiB". All ranks must use the
    /// same value.
    #[arg(
        long,
        default_value = "1GiB",
        value_name = "SIZE",
        help_heading = "Transfer options"
    )]
    pub chunk_size: bytesize::ByteSize,

    /// Archiver used to serialize and extract the tree (must understand `-cf -` and `-xf -`)
    #[arg(
        long,
        default_value = "tar",
        value_name = "PATH",
        help_heading = "Transfer options"
    )]
    pub tar: PathBuf,

    // Process group
    /// Address of rank 0 as HOST:PORT, defaults to the first host of $PBS_NODEFILE on port 29517
    #[arg(
        long,
        env = "BCAST_COORDINATOR",
        value_name = "HOST:PORT",
        help_heading = "Process group"
    )]
    pub coordinator: Option<String>,

    /// IP address rank 0 listens on (default: all interfaces)
    #[arg(long, value_name = "IP", help_heading = "Process group")]
    pub bind_ip: Option<std::net::IpAddr>,

    /// Seconds to wait for all ranks to connect
    #[arg(
        long,
        default_value = "60",
        value_name = "SECONDS",
        help_heading = "Process group"
    )]
    pub connect_timeout: u64,

    // Output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    pub quiet: bool,

    /// Write a DEBUG level log of every rank to PREFIX-rank<N>-<timestamp>-<random>
    #[arg(long, value_name = "PREFIX", help_heading = "Output")]
    pub debug_log_prefix: Option<String>,

    /// Print protocol version information as JSON and exit
    #[arg(long, help_heading = "Output")]
    pub protocol_version: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    pub max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    pub max_blocking_threads: usize,

    // ARGUMENTS
    /// Directory or file to distribute (read on rank 0 only)
    #[arg()]
    pub src: Option<PathBuf>,

    /// Directory every rank extracts into, created if missing [default: system temp directory]
    #[arg()]
    pub dst: Option<PathBuf>,

    #[arg(hide = true)]
    pub ignored: Vec<PathBuf>,
}

/// Everything a run needs, resolved from the command line once
#[derive(Debug, Clone)]
pub struct Invocation {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub transfer: common::TransferConfig,
    pub group: common::GroupConfig,
    pub output: common::OutputConfig,
    pub runtime: common::RuntimeConfig,
    pub debug_log_prefix: Option<String>,
    /// Positional arguments past DESTINATION
    pub ignored: Vec<PathBuf>,
}

impl Args {
    /// Validates the arguments and fills in defaults, without touching the environment
    /// beyond the temp directory lookup.
    pub fn resolve(self) -> Result<Invocation, Error> {
        let source: PathBuf = self
            .src
            .as_deref()
            .map(|src| src.components().collect::<PathBuf>())
            .filter(|src| !src.as_os_str().is_empty())
            .ok_or_else(|| Error::Argument("missing SOURCE argument".to_string()))?;
        let destination = self.dst.unwrap_or_else(std::env::temp_dir);
        let transfer = common::TransferConfig {
            chunk_size: self.chunk_size.as_u64(),
            no_root_write: self.no_root_write,
            tar: self.tar,
        };
        transfer.validate().map_err(Error::Argument)?;
        Ok(Invocation {
            source,
            destination,
            transfer,
            group: common::GroupConfig {
                coordinator: self.coordinator,
                bind_ip: self.bind_ip,
                connect_timeout: std::time::Duration::from_secs(self.connect_timeout),
            },
            output: common::OutputConfig {
                quiet: self.quiet,
                verbose: self.verbose,
            },
            runtime: common::RuntimeConfig {
                max_workers: self.max_workers,
                max_blocking_threads: self.max_blocking_threads,
            },
            debug_log_prefix: self.debug_log_prefix,
            ignored: self.ignored,
        })
    }
}
