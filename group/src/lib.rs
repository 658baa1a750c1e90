//! Fixed-size process group with the collective operations `bcast` is built on.
//!
//! Rank 0 (the coordinator) holds one link to every other rank (members). Every collective is
//! driven by the coordinator: it sends a [`protocol::Directive`] to all members and collects one
//! [`protocol::Report`] from each before returning, so no rank gets past a collective before
//! all ranks reached it.
//!
//! Failures are explicit: a member that fails reports a `Fault`, the coordinator turns the
//! first fault it sees into an `Abort` for everyone else. A rank never waits on a collective
//! that a failed rank will not join.

use futures::StreamExt;

pub mod bootstrap;
pub mod launch;
pub mod protocol;
pub mod streams;

pub use bootstrap::connect;
pub use launch::LaunchInfo;
pub use protocol::Announcement;

use protocol::{Directive, Report};
use streams::{BoxedRead, BoxedWrite, RecvStream, SendStream};

/// Capacity of the in-memory pipes of [`local`] groups
const LOCAL_PIPE_CAPACITY: usize = 64 * 1024;

/// How long a member whose report could not be sent waits for an abort already on its way
const PENDING_ABORT_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rank {rank} aborted the group: {reason}")]
    Aborted { rank: usize, reason: String },
    #[error("rank {rank} failed: {reason}")]
    PeerFault { rank: usize, reason: String },
    #[error("lost connection to rank {rank}")]
    Disconnected { rank: usize },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("failed to form the process group: {0:#}")]
    Bootstrap(anyhow::Error),
    #[error("link to rank {rank} failed: {cause:#}")]
    Link { rank: usize, cause: anyhow::Error },
}

impl Error {
    /// True if the failure was reported by the group rather than detected by this rank.
    ///
    /// Such failures have already been propagated, answering them with another abort would
    /// only produce noise.
    pub fn is_group_failure(&self) -> bool {
        matches!(self, Error::Aborted { .. } | Error::PeerFault { .. })
    }
}

/// Connection to one other rank
pub(crate) struct Link {
    rank: usize,
    send: SendStream<BoxedWrite>,
    recv: RecvStream<BoxedRead>,
}

impl Link {
    pub(crate) fn new(rank: usize, read: BoxedRead, write: BoxedWrite) -> Self {
        Self {
            rank,
            send: SendStream::new(write),
            recv: RecvStream::new(read),
        }
    }
}

enum Role {
    Coordinator { members: Vec<Link> },
    Member { coordinator: Link },
}

pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

/// Builds an in-process group of `world_size` ranks connected by in-memory pipes.
///
/// The ranks speak the same protocol as a TCP group; drive each of them from its own task.
pub fn local(world_size: usize) -> Vec<ProcessGroup> {
    assert!(world_size > 0, "a group needs at least one rank");
    let mut links = Vec::with_capacity(world_size - 1);
    let mut groups = Vec::with_capacity(world_size);
    for rank in 1..world_size {
        let (coordinator_side, member_side) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
        let (coordinator_read, coordinator_write) = tokio::io::split(coordinator_side);
        let (member_read, member_write) = tokio::io::split(member_side);
        links.push(Link::new(
            rank,
            Box::new(coordinator_read),
            Box::new(coordinator_write),
        ));
        groups.push(ProcessGroup::member(
            rank,
            world_size,
            Link::new(0, Box::new(member_read), Box::new(member_write)),
        ));
    }
    groups.insert(0, ProcessGroup::coordinator(world_size, links));
    groups
}

impl ProcessGroup {
    /// A group of one: every collective completes immediately
    pub fn single() -> Self {
        Self::coordinator(1, Vec::new())
    }

    pub(crate) fn coordinator(world_size: usize, members: Vec<Link>) -> Self {
        debug_assert_eq!(members.len() + 1, world_size);
        Self {
            rank: 0,
            world_size,
            role: Role::Coordinator { members },
        }
    }

    pub(crate) fn member(rank: usize, world_size: usize, coordinator: Link) -> Self {
        Self {
            rank,
            world_size,
            role: Role::Member { coordinator },
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self.role, Role::Coordinator { .. })
    }

    /// Broadcasts the coordinator's announcement to every rank.
    ///
    /// The coordinator must pass `Some`, members pass `None` and receive the coordinator's value.
    pub async fn broadcast_announcement(
        &mut self,
        announcement: Option<Announcement>,
    ) -> Result<Announcement, Error> {
        if self.is_coordinator() {
            let announcement = announcement.ok_or_else(|| {
                Error::Protocol("the coordinator must supply the announcement".to_string())
            })?;
            // a member that cannot be reached shows up as a fault in the gather
            self.deliver(&Directive::Announce(announcement), None)
                .await;
            self.collect_acks().await?;
            tracing::trace!("announced {:?}", announcement);
            Ok(announcement)
        } else {
            match self.receive().await? {
                Directive::Announce(announcement) => {
                    self.report(&Report::Ack).await?;
                    Ok(announcement)
                }
                other => Err(Error::Protocol(format!(
                    "expected an announcement, received {other:?}"
                ))),
            }
        }
    }

    /// Copies the coordinator's current chunk into every member's buffer.
    ///
    /// `len` is the length announced for this iteration; the coordinator's buffer must hold
    /// exactly that many bytes, members' buffers hold them when this returns.
    pub async fn broadcast_data(
        &mut self,
        buffer: &mut common::ChunkBuffer,
        len: u64,
    ) -> Result<(), Error> {
        if self.is_coordinator() {
            if buffer.len() as u64 != len {
                return Err(Error::Protocol(format!(
                    "announced {} bytes but the chunk holds {}",
                    len,
                    buffer.len()
                )));
            }
            self.deliver(&Directive::Data { len }, Some(buffer.as_slice()))
                .await;
            self.collect_acks().await
        } else {
            match self.receive().await? {
                Directive::Data { len: sent } if sent == len => {
                    let len = usize::try_from(len).map_err(|_| {
                        Error::Protocol(format!("chunk of {len} bytes is too large"))
                    })?;
                    let slot = buffer
                        .receive_slot(len)
                        .map_err(|error| Error::Protocol(error.to_string()))?;
                    if let Role::Member { coordinator } = &mut self.role {
                        coordinator
                            .recv
                            .recv_exact(slot)
                            .await
                            .map_err(|cause| Error::Link { rank: 0, cause })?;
                    }
                    self.report(&Report::Ack).await
                }
                Directive::Data { len: sent } => Err(Error::Protocol(format!(
                    "announced {len} bytes but {sent} were sent"
                ))),
                other => Err(Error::Protocol(format!(
                    "expected chunk data, received {other:?}"
                ))),
            }
        }
    }

    /// All-reduce with the maximum operator, every rank returns the group maximum.
    pub async fn reduce_max(&mut self, value: f64) -> Result<f64, Error> {
        if self.is_coordinator() {
            let mut max = value;
            for (rank, report) in self.gather().await? {
                match report {
                    Report::Value(value) => max = max.max(value),
                    other => {
                        return Err(self
                            .fail_member(
                                rank,
                                format!("protocol violation: expected a value, received {other:?}"),
                            )
                            .await);
                    }
                }
            }
            if let Some((rank, error)) = self
                .deliver(&Directive::Reduced { max }, None)
                .await
                .into_iter()
                .next()
            {
                return Err(self
                    .fail_member(rank, format!("connection lost: {error:#}"))
                    .await);
            }
            Ok(max)
        } else {
            self.report(&Report::Value(value)).await?;
            match self.receive().await? {
                Directive::Reduced { max } => Ok(max),
                other => Err(Error::Protocol(format!(
                    "expected the reduction result, received {other:?}"
                ))),
            }
        }
    }

    /// Tells the group this rank failed, best effort.
    ///
    /// On the coordinator every member receives an `Abort` in place of its next directive; a
    /// member reports a `Fault`, which the coordinator forwards to all other members at the
    /// next collective.
    pub async fn abort(&mut self, reason: &str) {
        tracing::error!("aborting the group: {}", reason);
        if self.is_coordinator() {
            self.broadcast_abort(self.rank, reason).await;
        } else if let Err(error) = self
            .report(&Report::Fault {
                reason: reason.to_string(),
            })
            .await
        {
            tracing::debug!("could not report fault to the coordinator: {:#}", error);
        }
    }

    // coordinator: send the directive (and payload) to every member concurrently, returns the
    // members that could not be reached
    async fn deliver(
        &mut self,
        directive: &Directive,
        data: Option<&[u8]>,
    ) -> Vec<(usize, anyhow::Error)> {
        let Role::Coordinator { members } = &mut self.role else {
            return Vec::new();
        };
        let results = futures::future::join_all(members.iter_mut().map(|link| async move {
            let result = match data {
                Some(bytes) => link.send.send_message_with_bytes(directive, bytes).await,
                None => link.send.send_control_message(directive).await,
            };
            (link.rank, result)
        }))
        .await;
        results
            .into_iter()
            .filter_map(|(rank, result)| {
                let error = result.err()?;
                tracing::debug!("failed to send to rank {}: {:#}", rank, error);
                Some((rank, error))
            })
            .collect()
    }

    // coordinator: one report from every member, in completion order so a fault is seen
    // even while other members are still busy
    async fn gather(&mut self) -> Result<Vec<(usize, Report)>, Error> {
        let Role::Coordinator { members } = &mut self.role else {
            return Err(Error::Protocol("only the coordinator gathers".to_string()));
        };
        let mut pending: futures::stream::FuturesUnordered<_> = members
            .iter_mut()
            .map(|link| async move { (link.rank, link.recv.recv_object::<Report>().await) })
            .collect();
        let mut reports = Vec::with_capacity(pending.len());
        let mut fault = None;
        while let Some((rank, result)) = pending.next().await {
            match result {
                Ok(Some(Report::Fault { reason })) => {
                    fault = Some((rank, reason));
                    break;
                }
                Ok(Some(report)) => reports.push((rank, report)),
                Ok(None) => {
                    fault = Some((rank, "connection closed".to_string()));
                    break;
                }
                Err(error) => {
                    fault = Some((rank, format!("connection lost: {error:#}")));
                    break;
                }
            }
        }
        drop(pending);
        match fault {
            Some((rank, reason)) => Err(self.fail_member(rank, reason).await),
            None => Ok(reports),
        }
    }

    async fn collect_acks(&mut self) -> Result<(), Error> {
        for (rank, report) in self.gather().await? {
            if !matches!(report, Report::Ack) {
                return Err(self
                    .fail_member(
                        rank,
                        format!("protocol violation: expected an ack, received {report:?}"),
                    )
                    .await);
            }
        }
        Ok(())
    }

    // coordinator: abort everybody else on behalf of the failed member
    async fn fail_member(&mut self, rank: usize, reason: String) -> Error {
        tracing::error!("rank {} failed: {}", rank, reason);
        self.broadcast_abort(rank, &reason).await;
        Error::PeerFault { rank, reason }
    }

    async fn broadcast_abort(&mut self, origin: usize, reason: &str) {
        let Role::Coordinator { members } = &mut self.role else {
            return;
        };
        let directive = Directive::Abort {
            rank: origin,
            reason: reason.to_string(),
        };
        let directive = &directive;
        futures::future::join_all(
            members
                .iter_mut()
                .filter(|link| link.rank != origin)
                .map(|link| async move {
                    if let Err(error) = link.send.send_control_message(directive).await {
                        tracing::debug!(
                            "could not deliver abort to rank {}: {:#}",
                            link.rank,
                            error
                        );
                    }
                }),
        )
        .await;
    }

    // member: next directive from the coordinator, an abort becomes an error
    async fn receive(&mut self) -> Result<Directive, Error> {
        let Role::Member { coordinator } = &mut self.role else {
            return Err(Error::Protocol("the coordinator does not receive".to_string()));
        };
        match coordinator.recv.recv_object::<Directive>().await {
            Ok(Some(Directive::Abort { rank, reason })) => Err(Error::Aborted { rank, reason }),
            Ok(Some(directive)) => Ok(directive),
            Ok(None) => Err(Error::Disconnected { rank: 0 }),
            Err(cause) => Err(Error::Link { rank: 0, cause }),
        }
    }

    // member: a coordinator that stopped listening usually did so after sending an abort, which
    // names the rank that actually failed
    async fn report(&mut self, report: &Report) -> Result<(), Error> {
        let Role::Member { coordinator } = &mut self.role else {
            return Err(Error::Protocol("the coordinator does not report".to_string()));
        };
        let Err(cause) = coordinator.send.send_control_message(report).await else {
            return Ok(());
        };
        tracing::debug!("could not report to the coordinator: {:#}", cause);
        match tokio::time::timeout(PENDING_ABORT_WAIT, self.receive()).await {
            Ok(Err(aborted @ Error::Aborted { .. })) => Err(aborted),
            _ => Err(Error::Link { rank: 0, cause }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    async fn filled(data: &[u8], capacity: usize) -> common::ChunkBuffer {
        let mut buffer = common::ChunkBuffer::new(capacity);
        buffer.fill(&mut &data[..]).await.unwrap();
        buffer
    }

    #[test]
    fn local_group_assigns_ranks_in_order() {
        let groups = local(4);
        assert_eq!(groups.len(), 4);
        for (rank, group) in groups.iter().enumerate() {
            assert_eq!(group.rank(), rank);
            assert_eq!(group.world_size(), 4);
            assert_eq!(group.is_coordinator(), rank == 0);
        }
    }

    #[tokio::test]
    async fn single_rank_collectives_complete_immediately() -> anyhow::Result<()> {
        let mut group = ProcessGroup::single();
        let announcement = group
            .broadcast_announcement(Some(Announcement::Chunk { len: 3 }))
            .await?;
        assert_eq!(announcement, Announcement::Chunk { len: 3 });
        let mut buffer = filled(b"abc", 8).await;
        group.broadcast_data(&mut buffer, 3).await?;
        assert_eq!(group.reduce_max(1.5).await?, 1.5);
        Ok(())
    }

    #[tokio::test]
    async fn coordinator_must_supply_the_announcement() {
        let mut group = ProcessGroup::single();
        assert!(matches!(
            group.broadcast_announcement(None).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn every_rank_receives_the_same_chunk() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut tasks = Vec::new();
        for mut group in local(4) {
            let payload = payload.clone();
            tasks.push(tokio::spawn(async move {
                let mut buffer = if group.is_coordinator() {
                    filled(&payload, 128 * 1024).await
                } else {
                    common::ChunkBuffer::new(128 * 1024)
                };
                let local = group
                    .is_coordinator()
                    .then(|| Announcement::from_len(buffer.len()));
                let announcement = group.broadcast_announcement(local).await?;
                group
                    .broadcast_data(&mut buffer, announcement.chunk_len())
                    .await?;
                let sentinel = group.is_coordinator().then_some(Announcement::Done);
                let done = group.broadcast_announcement(sentinel).await?;
                assert!(done.is_done());
                anyhow::Ok((announcement, buffer.as_slice().to_vec()))
            }));
        }
        for task in tasks {
            let (announcement, received) = task.await??;
            assert_eq!(announcement.chunk_len(), payload.len() as u64);
            assert_eq!(received, payload);
        }
        Ok(())
    }

    #[tokio::test]
    async fn reduction_returns_group_maximum_everywhere() -> anyhow::Result<()> {
        let mut tasks = Vec::new();
        for mut group in local(5) {
            tasks.push(tokio::spawn(async move {
                let value = [0.5, 3.25, 1.0, 2.0, 0.0][group.rank()];
                group.reduce_max(value).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await??, 3.25);
        }
        Ok(())
    }

    #[traced_test]
    #[tokio::test]
    async fn coordinator_abort_reaches_every_member() -> anyhow::Result<()> {
        let mut groups = local(3);
        let mut coordinator = groups.remove(0);
        let members: Vec<_> = groups
            .into_iter()
            .map(|mut group| {
                tokio::spawn(async move { group.broadcast_announcement(None).await })
            })
            .collect();
        coordinator.abort("cannot read archive stream").await;
        for member in members {
            match member.await? {
                Err(Error::Aborted { rank, reason }) => {
                    assert_eq!(rank, 0);
                    assert!(reason.contains("cannot read archive stream"));
                }
                other => panic!("expected an abort, got {other:?}"),
            }
        }
        assert!(logs_contain("aborting the group"));
        Ok(())
    }

    #[traced_test]
    #[tokio::test]
    async fn member_fault_is_forwarded_to_other_members() -> anyhow::Result<()> {
        let mut groups = local(4);
        let mut coordinator = groups.remove(0);
        let mut failing = groups.remove(1);
        assert_eq!(failing.rank(), 2);
        let healthy: Vec<_> = groups
            .into_iter()
            .map(|mut group| {
                tokio::spawn(async move {
                    let first = group.broadcast_announcement(None).await;
                    let second = group.broadcast_announcement(None).await;
                    (first, second)
                })
            })
            .collect();
        failing.abort("disk full").await;
        let result = coordinator
            .broadcast_announcement(Some(Announcement::Chunk { len: 1 }))
            .await;
        match result {
            Err(Error::PeerFault { rank, reason }) => {
                assert_eq!(rank, 2);
                assert_eq!(reason, "disk full");
            }
            other => panic!("expected a peer fault, got {other:?}"),
        }
        for task in healthy {
            // the announcement was already on its way, the abort takes the next directive's place
            let (first, second) = task.await?;
            assert_eq!(first?, Announcement::Chunk { len: 1 });
            match second {
                Err(Error::Aborted { rank, reason }) => {
                    assert_eq!(rank, 2);
                    assert_eq!(reason, "disk full");
                }
                other => panic!("expected an abort, got {other:?}"),
            }
        }
        assert!(logs_contain("rank 2 failed"));
        drop(failing);
        Ok(())
    }

    #[tokio::test]
    async fn abort_queued_behind_an_announcement_wins_over_the_broken_link() -> anyhow::Result<()> {
        let mut groups = local(3);
        let mut failing = groups.pop().unwrap();
        let mut late = groups.pop().unwrap();
        let mut coordinator = groups.pop().unwrap();
        failing.abort("disk full").await;
        // rank 1 has not acked yet, the fault of rank 2 ends the gather
        let result = coordinator
            .broadcast_announcement(Some(Announcement::Chunk { len: 1 }))
            .await;
        assert!(matches!(result, Err(Error::PeerFault { rank: 2, .. })));
        drop(coordinator);
        match late.broadcast_announcement(None).await {
            Err(Error::Aborted { rank, reason }) => {
                assert_eq!(rank, 2);
                assert_eq!(reason, "disk full");
            }
            other => panic!("expected an abort, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn silent_coordinator_exit_is_a_link_failure() {
        let mut groups = local(2);
        let mut member = groups.pop().unwrap();
        drop(groups);
        assert!(matches!(
            member.reduce_max(1.0).await,
            Err(Error::Link { rank: 0, .. })
        ));
    }

    #[tokio::test]
    async fn vanished_member_is_a_peer_fault() -> anyhow::Result<()> {
        let mut groups = local(3);
        let mut coordinator = groups.remove(0);
        let survivor = groups.remove(0);
        drop(groups);
        let survivor = tokio::spawn(async move {
            let mut survivor = survivor;
            let first = survivor.broadcast_announcement(None).await;
            let second = survivor.broadcast_announcement(None).await;
            (first, second)
        });
        let result = coordinator
            .broadcast_announcement(Some(Announcement::Done))
            .await;
        assert!(matches!(result, Err(Error::PeerFault { rank: 2, .. })));
        let (first, second) = survivor.await?;
        // depending on timing the survivor sees the announcement first or only the abort
        let aborted = match first {
            Ok(_) => second,
            Err(error) => Err(error),
        };
        assert!(matches!(aborted, Err(Error::Aborted { rank: 2, .. })));
        Ok(())
    }

    #[test]
    fn group_failures_are_not_escalated_again() {
        let aborted = Error::Aborted {
            rank: 0,
            reason: "x".to_string(),
        };
        let fault = Error::PeerFault {
            rank: 1,
            reason: "y".to_string(),
        };
        assert!(aborted.is_group_failure());
        assert!(fault.is_group_failure());
        assert!(!Error::Disconnected { rank: 0 }.is_group_failure());
        assert!(!Error::Protocol("z".to_string()).is_group_failure());
    }
}
