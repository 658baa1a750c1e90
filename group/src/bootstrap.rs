//! Forms a [`ProcessGroup`] over TCP: rank 0 listens, every other rank connects and says hello.

use anyhow::{Context, anyhow};
use futures::StreamExt;
use tokio::time::Instant;

use crate::launch::{self, LaunchInfo};
use crate::protocol::{Directive, Hello, Report};
use crate::streams::{BoxedRead, BoxedWrite, RecvStream, SendStream};
use crate::{Error, Link, ProcessGroup};

/// Pause between connection attempts while the coordinator is not listening yet
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Joins this process into the group described by `launch`.
///
/// Blocks until all `world_size` ranks are connected or `config.connect_timeout` expires. A group
/// of one needs no coordinator and returns right away.
pub async fn connect(
    launch: &LaunchInfo,
    config: &common::GroupConfig,
) -> Result<ProcessGroup, Error> {
    if launch.world_size == 1 {
        return Ok(ProcessGroup::single());
    }
    let address = launch::resolve_coordinator(config.coordinator.as_deref(), |name| {
        std::env::var(name).ok()
    })
    .map_err(Error::Bootstrap)?
    .ok_or_else(|| {
        Error::Bootstrap(anyhow!(
            "no coordinator address for a group of {}: \
             pass --coordinator HOST:PORT or set BCAST_COORDINATOR",
            launch.world_size
        ))
    })?;
    tracing::info!(
        "forming group of {} via {} as rank {}",
        launch.world_size,
        address,
        launch.rank
    );
    if launch.is_coordinator() {
        let listener = listen(&address, config.bind_ip)
            .await
            .map_err(Error::Bootstrap)?;
        accept_members(listener, launch.world_size, config.connect_timeout).await
    } else {
        join(
            &address,
            launch.rank,
            launch.world_size,
            config.connect_timeout,
        )
        .await
    }
}

/// Binds the coordinator's listener on the port of `address`.
pub async fn listen(
    address: &str,
    bind_ip: Option<std::net::IpAddr>,
) -> anyhow::Result<tokio::net::TcpListener> {
    let port = address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("coordinator address {address:?} is not of the form HOST:PORT"))?;
    let ip = bind_ip.unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let listener = tokio::net::TcpListener::bind((ip, port))
        .await
        .with_context(|| format!("failed to listen on {ip}:{port}"))?;
    tracing::info!("listening for members on {}", listener.local_addr()?);
    Ok(listener)
}

/// A connection accepted by the coordinator together with its first message
struct Greeting {
    peer: std::net::SocketAddr,
    send: SendStream<BoxedWrite>,
    recv: RecvStream<BoxedRead>,
    first: anyhow::Result<Option<Report>>,
}

async fn greet(stream: tokio::net::TcpStream, peer: std::net::SocketAddr) -> Greeting {
    if let Err(error) = stream.set_nodelay(true) {
        tracing::debug!("failed to set TCP_NODELAY for {}: {}", peer, error);
    }
    let (read_half, write_half) = stream.into_split();
    let mut recv = RecvStream::new(Box::new(read_half) as BoxedRead);
    let send = SendStream::new(Box::new(write_half) as BoxedWrite);
    let first = recv.recv_object::<Report>().await;
    Greeting {
        peer,
        send,
        recv,
        first,
    }
}

enum Event {
    Accepted(std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)>),
    Greeted(Greeting),
    Expired,
}

/// Accepts one connection from every member rank and returns the coordinator's group.
///
/// Hellos are read concurrently with accepting, a connection that never says hello does not
/// delay the members behind it.
pub async fn accept_members(
    listener: tokio::net::TcpListener,
    world_size: usize,
    timeout: std::time::Duration,
) -> Result<ProcessGroup, Error> {
    let deadline = Instant::now() + timeout;
    let expected = world_size - 1;
    let mut slots: Vec<Option<Link>> = (0..expected).map(|_| None).collect();
    let mut joined = 0;
    let mut greetings = futures::stream::FuturesUnordered::new();
    let ours = common::version::ProtocolVersion::current();
    while joined < expected {
        let event = tokio::select! {
            accepted = listener.accept() => Event::Accepted(accepted),
            Some(greeting) = greetings.next() => Event::Greeted(greeting),
            () = tokio::time::sleep_until(deadline) => Event::Expired,
        };
        let Greeting {
            peer,
            mut send,
            recv,
            first,
        } = match event {
            Event::Accepted(accepted) => {
                let (stream, peer) = accepted
                    .context("failed to accept member connection")
                    .map_err(Error::Bootstrap)?;
                greetings.push(greet(stream, peer));
                continue;
            }
            Event::Greeted(greeting) => greeting,
            Event::Expired => {
                if !greetings.is_empty() {
                    tracing::warn!("{} connections never sent a hello", greetings.len());
                }
                return Err(Error::Bootstrap(anyhow!(
                    "timed out after {:?} with {} of {} members connected",
                    timeout,
                    joined,
                    expected
                )));
            }
        };
        let hello = match first {
            Ok(Some(Report::Hello(hello))) => hello,
            Ok(Some(other)) => {
                tracing::warn!("ignoring connection from {}: sent {:?} before hello", peer, other);
                continue;
            }
            Ok(None) => {
                tracing::warn!("ignoring connection from {}: closed before hello", peer);
                continue;
            }
            Err(error) => {
                tracing::warn!("ignoring connection from {}: {:#}", peer, error);
                continue;
            }
        };
        let verdict = validate_hello(&hello, &ours, world_size, &slots);
        if let Err(reason) = verdict {
            // tell the offender why before the group goes down
            let directive = Directive::Abort {
                rank: 0,
                reason: reason.clone(),
            };
            if let Err(error) = send.send_control_message(&directive).await {
                tracing::debug!("could not reject {}: {:#}", peer, error);
            }
            return Err(Error::Bootstrap(anyhow!("member at {peer}: {reason}")));
        }
        tracing::debug!("rank {} joined from {}", hello.rank, peer);
        slots[hello.rank - 1] = Some(Link {
            rank: hello.rank,
            send,
            recv,
        });
        joined += 1;
    }
    let members: Vec<Link> = slots.into_iter().flatten().collect();
    tracing::info!("all {} ranks connected", world_size);
    Ok(ProcessGroup::coordinator(world_size, members))
}

fn validate_hello(
    hello: &Hello,
    ours: &common::version::ProtocolVersion,
    world_size: usize,
    slots: &[Option<Link>],
) -> Result<(), String> {
    if !ours.is_compatible_with(&hello.version) {
        return Err(format!(
            "rank {} runs version {} but the coordinator runs {}",
            hello.rank, hello.version, ours
        ));
    }
    if hello.world_size != world_size {
        return Err(format!(
            "rank {} expects a group of {} but the coordinator expects {}",
            hello.rank, hello.world_size, world_size
        ));
    }
    if hello.rank == 0 || hello.rank >= world_size {
        return Err(format!(
            "rank {} is not a member rank of a group of {}",
            hello.rank, world_size
        ));
    }
    if slots[hello.rank - 1].is_some() {
        return Err(format!("rank {} joined twice", hello.rank));
    }
    Ok(())
}

/// Connects to the coordinator at `address`, retrying until `timeout` while it is not up yet.
pub async fn join(
    address: &str,
    rank: usize,
    world_size: usize,
    timeout: std::time::Duration,
) -> Result<ProcessGroup, Error> {
    let deadline = Instant::now() + timeout;
    let attempt = async {
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            match tokio::net::TcpStream::connect(address).await {
                Ok(stream) => break stream,
                Err(error) => {
                    tracing::debug!(
                        "attempt {} to reach coordinator {} failed: {}",
                        attempts,
                        address,
                        error
                    );
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    };
    let stream = tokio::time::timeout_at(deadline, attempt)
        .await
        .map_err(|_| {
            Error::Bootstrap(anyhow!(
                "could not reach coordinator {address} within {timeout:?}"
            ))
        })?;
    if let Err(error) = stream.set_nodelay(true) {
        tracing::debug!("failed to set TCP_NODELAY: {}", error);
    }
    let (read_half, write_half) = stream.into_split();
    let mut link = Link::new(0, Box::new(read_half), Box::new(write_half));
    let hello = Report::Hello(Hello {
        rank,
        world_size,
        version: common::version::ProtocolVersion::current(),
    });
    link.send
        .send_control_message(&hello)
        .await
        .map_err(|cause| Error::Link { rank: 0, cause })?;
    tracing::info!("joined coordinator {} as rank {}", address, rank);
    Ok(ProcessGroup::member(rank, world_size, link))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_of_one_needs_no_coordinator() -> anyhow::Result<()> {
        let config = common::GroupConfig {
            coordinator: None,
            ..Default::default()
        };
        let group = connect(&LaunchInfo::single(), &config).await?;
        assert_eq!(group.world_size(), 1);
        assert!(group.is_coordinator());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_address_is_rejected() {
        let error = listen("localhost", None).await.unwrap_err();
        assert!(format!("{error:#}").contains("HOST:PORT"));
    }

    #[tokio::test]
    async fn join_gives_up_after_timeout() {
        // bind and drop to find a port nobody listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = join(
            &format!("127.0.0.1:{port}"),
            1,
            2,
            std::time::Duration::from_millis(300),
        )
        .await;
        assert!(matches!(result, Err(Error::Bootstrap(_))));
    }

    #[tokio::test]
    async fn coordinator_times_out_waiting_for_members() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = accept_members(listener, 3, std::time::Duration::from_millis(200)).await;
        match result {
            Err(Error::Bootstrap(error)) => {
                assert!(format!("{error:#}").contains("0 of 2 members"));
            }
            other => panic!("expected a bootstrap timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_connection_does_not_hold_up_members() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let coordinator = tokio::spawn(accept_members(
            listener,
            2,
            std::time::Duration::from_secs(30),
        ));
        let _idle = tokio::net::TcpStream::connect(&address).await?;
        let mut member = join(&address, 1, 2, std::time::Duration::from_secs(30)).await?;
        let mut coordinator =
            tokio::time::timeout(std::time::Duration::from_secs(5), coordinator).await???;
        let (max, member_max) = tokio::join!(coordinator.reduce_max(1.0), member.reduce_max(2.0));
        assert_eq!(max?, 2.0);
        assert_eq!(member_max?, 2.0);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_group_size_fails_bootstrap() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let coordinator = tokio::spawn(accept_members(
            listener,
            2,
            std::time::Duration::from_secs(10),
        ));
        let mut member = join(&address, 1, 3, std::time::Duration::from_secs(10)).await?;
        assert!(matches!(
            coordinator.await?,
            Err(Error::Bootstrap(_))
        ));
        // the rejected member learns why
        match member.broadcast_announcement(None).await {
            Err(Error::Aborted { reason, .. }) => assert!(reason.contains("expects a group of 3")),
            other => panic!("expected an abort, got {other:?}"),
        }
        Ok(())
    }
}
