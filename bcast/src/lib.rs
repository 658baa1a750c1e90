//! `bcast` streams a directory tree from rank 0 of a job to node-local storage of every rank.
//!
//! Rank 0 runs the archiver (`tar -cf -`) on the source and reads its output into a
//! fixed-size [`common::ChunkBuffer`]. Each chunk is broadcast to the whole
//! [`group::ProcessGroup`] and fed into every rank's extractor (`tar -xf -`), so no process ever
//! holds more than one chunk of the stream and no rank stages the archive on disk.
//!
//! A failure on any rank aborts all of them: see [`transfer::distribute`].

pub mod args;
pub mod destination;
pub mod error;
pub mod report;
pub mod source;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use args::{Args, Invocation};
pub use error::Error;
pub use report::Throughput;

use destination::ArchiveSink;
use source::ArchiveSource;

/// Runs the whole transfer on an already formed group.
///
/// Returns the group-wide throughput on the coordinator and `None` on every other rank.
pub async fn broadcast_tree(
    group: &mut group::ProcessGroup,
    invocation: &Invocation,
    started: std::time::Instant,
) -> Result<Option<Throughput>, Error> {
    let capacity = usize::try_from(invocation.transfer.chunk_size).map_err(|_| {
        Error::Argument(format!(
            "chunk size {} does not fit in memory",
            invocation.transfer.chunk_size
        ))
    })?;
    let mut buffer = common::ChunkBuffer::new(capacity);
    let tar = &invocation.transfer.tar;
    let mut source = if group.is_coordinator() {
        let opened = ArchiveSource::spawn(tar, &invocation.source).await;
        Some(transfer::escalate(group, opened).await?)
    } else {
        None
    };
    let mut sink = if group.is_coordinator() && invocation.transfer.no_root_write {
        tracing::info!("not extracting on the coordinator");
        None
    } else {
        let opened = ArchiveSink::open(tar, &invocation.destination).await;
        Some(transfer::escalate(group, opened).await?)
    };
    let outcome = transfer::distribute(
        group,
        source.as_mut(),
        sink.as_mut(),
        &mut buffer,
        started,
    )
    .await?;
    Ok(group.is_coordinator().then_some(Throughput {
        bytes: outcome.stats.bytes,
        seconds: outcome.slowest,
    }))
}

/// Joins the group described by `launch` and runs the transfer.
pub async fn run(
    invocation: &Invocation,
    launch: &group::LaunchInfo,
    started: std::time::Instant,
) -> Result<Option<Throughput>, Error> {
    let mut group = group::connect(launch, &invocation.group).await?;
    broadcast_tree(&mut group, invocation, started).await
}
