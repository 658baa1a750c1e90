//! Shared building blocks of the `bcast` tools: the chunk buffer, configuration types and the
//! runtime/logging harness every binary runs under.

use rand::Rng;
use tracing::Instrument;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod chunk;
pub mod config;
pub mod version;

pub use chunk::ChunkBuffer;
pub use config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_COORDINATOR_PORT, GroupConfig, OutputConfig, RuntimeConfig,
    TracingConfig, TransferConfig,
};

/// Builds a unique log file name, e.g. `/tmp/bcast-log-rank3-2024-05-01T12-00-00-Ab3x9`.
pub fn generate_debug_log_filename(prefix: &str, identifier: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    format!("{prefix}-{identifier}-{timestamp}-{suffix}")
}

fn console_level(output: &OutputConfig) -> &'static str {
    if output.quiet {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over -v, but never over --quiet
    let console_filter = if output.quiet {
        tracing_subscriber::EnvFilter::new("off")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(console_level(output)))
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);
    let file_layer = match tracing_config.debug_log_file {
        Some(ref path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| anyhow::anyhow!("cannot create debug log file {path:?}: {e}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(tracing_subscriber::EnvFilter::new("debug")),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Sets up logging and a tokio runtime, then drives `func` to completion.
///
/// Errors returned by `func` are logged (alternate formatting, so the whole cause chain is
/// shown) and turned into `None`; the caller decides the exit code.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = Result<Summary, Error>>,
    Error: std::fmt::Display,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        eprintln!("failed to initialize logging: {error:#}");
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to create tokio runtime: {:#}", error);
            return None;
        }
    };
    let span = tracing::error_span!(
        "run",
        id = %tracing_config.trace_identifier,
        rank = tracing_config.rank
    );
    tokio_runtime.block_on(
        async move {
            match func().await {
                Ok(summary) => Some(summary),
                Err(error) => {
                    tracing::error!("{:#}", error);
                    None
                }
            }
        }
        .instrument(span),
    )
}
