use bcast::{Args, Invocation, Throughput};
use clap::{CommandFactory, Parser};

async fn async_main(
    invocation: Invocation,
    launch: group::LaunchInfo,
    started: std::time::Instant,
) -> Result<Option<Throughput>, bcast::Error> {
    if launch.is_coordinator() {
        println!(
            "bcast: Broadcasting {} to {}...",
            invocation.source.display(),
            invocation.destination.display()
        );
        if !invocation.ignored.is_empty() {
            tracing::warn!("ignoring extra arguments {:?}", invocation.ignored);
        }
    }
    bcast::run(&invocation, &launch, started).await
}

fn main() -> Result<(), anyhow::Error> {
    let started = std::time::Instant::now();
    let args = Args::parse();
    if args.protocol_version {
        let version = common::version::ProtocolVersion::current();
        println!("{}", version.to_json()?);
        return Ok(());
    }
    let launch = match group::LaunchInfo::from_env() {
        Ok(launch) => launch,
        Err(error) => {
            eprintln!("bcast: {error:#}");
            std::process::exit(1);
        }
    };
    // every rank parses the same argv and fails the same way, before any rank connects
    let invocation = match args.resolve() {
        Ok(invocation) => invocation,
        Err(error) => {
            if launch.is_coordinator() {
                eprintln!("bcast: {error}");
                eprintln!("{}", Args::command().render_usage());
            }
            std::process::exit(1);
        }
    };
    let debug_log_file = invocation.debug_log_prefix.as_ref().map(|prefix| {
        let filename =
            common::generate_debug_log_filename(prefix, &format!("rank{}", launch.rank));
        if launch.is_coordinator() {
            println!("bcast: Debug logging to file: {filename}");
        }
        filename
    });
    let tracing = common::TracingConfig {
        debug_log_file,
        trace_identifier: "bcast".to_string(),
        rank: launch.rank,
    };
    let output = invocation.output;
    let runtime = invocation.runtime;
    let func = || async_main(invocation, launch, started);
    match common::run(output, runtime, tracing, func) {
        Some(Some(throughput)) => println!("bcast: {throughput}"),
        Some(None) => {}
        None => std::process::exit(1),
    }
    Ok(())
}
