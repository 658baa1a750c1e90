//! The collective broadcast loop.
//!
//! Every iteration is two collectives: the coordinator announces the length of the chunk it
//! just read, then broadcasts its bytes. Every rank with a sink writes the chunk before the
//! next iteration starts, so all ranks hold the same prefix of the stream at every step. A
//! zero-length announcement ends the loop on all ranks at once.

use common::ChunkBuffer;
use group::{Announcement, ProcessGroup};

use crate::destination::ChunkSink;
use crate::source::ChunkSource;
use crate::Error;

/// What the loop moved, identical on every rank
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Non-sentinel chunks broadcast
    pub chunks: u64,
    pub bytes: u64,
}

/// Result of a completed run on one rank
#[derive(Clone, Copy, Debug)]
pub struct Outcome {
    pub stats: TransferStats,
    /// Wall time of the slowest rank, in seconds
    pub slowest: f64,
}

/// Streams until the end of the source is announced.
///
/// The coordinator passes its source, other ranks pass `None`. Any rank may pass `None` for the
/// sink to only take part in the collectives.
pub async fn broadcast_stream<S: ChunkSource, K: ChunkSink>(
    group: &mut ProcessGroup,
    mut source: Option<&mut S>,
    mut sink: Option<&mut K>,
    buffer: &mut ChunkBuffer,
) -> Result<TransferStats, Error> {
    let mut stats = TransferStats::default();
    loop {
        let local = match source.as_deref_mut() {
            Some(source) => {
                let len = source.fill(buffer).await?;
                if len == 0 {
                    // a failed archiver must not look like a complete stream
                    source.finish().await?;
                }
                Some(Announcement::from_len(len))
            }
            None => None,
        };
        let announcement = group.broadcast_announcement(local).await?;
        if announcement.is_done() {
            tracing::debug!(
                "end of stream after {} chunks ({} bytes)",
                stats.chunks,
                stats.bytes
            );
            return Ok(stats);
        }
        group
            .broadcast_data(buffer, announcement.chunk_len())
            .await?;
        if let Some(sink) = sink.as_deref_mut() {
            sink.write_chunk(buffer).await?;
        }
        stats.chunks += 1;
        stats.bytes += announcement.chunk_len();
        tracing::trace!("chunk {} done, {} bytes so far", stats.chunks, stats.bytes);
    }
}

/// Tells the rest of the group about a failure detected by this rank.
pub async fn escalate<T>(group: &mut ProcessGroup, result: Result<T, Error>) -> Result<T, Error> {
    if let Err(ref error) = result {
        if error.is_local() {
            group.abort(&format!("{error:#}")).await;
        }
    }
    result
}

/// Runs the loop, closes the sink and agrees on the slowest rank's wall time.
///
/// A failure on any rank, including a sink that fails to close, fails the run on every rank.
pub async fn distribute<S: ChunkSource, K: ChunkSink>(
    group: &mut ProcessGroup,
    source: Option<&mut S>,
    mut sink: Option<&mut K>,
    buffer: &mut ChunkBuffer,
    started: std::time::Instant,
) -> Result<Outcome, Error> {
    let streamed = broadcast_stream(group, source, sink.as_deref_mut(), buffer).await;
    let stats = escalate(group, streamed).await?;
    if let Some(sink) = sink {
        let closed = sink.close().await;
        escalate(group, closed).await?;
    }
    let elapsed = started.elapsed().as_secs_f64();
    let reduced = group.reduce_max(elapsed).await.map_err(Error::from);
    let slowest = escalate(group, reduced).await?;
    tracing::info!(
        "rank {} done in {:.2}s, slowest rank took {:.2}s",
        group.rank(),
        elapsed,
        slowest
    );
    Ok(Outcome { stats, slowest })
}
