//! Multicast game discovery: the announcement TTL cache and the listener
//! task feeding it.

use log::{debug, warn};
use shared::{
    decode_message, GameAnnouncement, MessageBody, ANNOUNCEMENT_WAIT_MS, MAX_DATAGRAM,
    MULTICAST_GROUP, MULTICAST_PORT,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Destination every master multicasts its announcements to.
pub fn multicast_target() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT))
}

/// One advertised game as last heard on the multicast group.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub game: GameAnnouncement,
    pub server_addr: SocketAddr,
    pub last_received: Instant,
}

/// TTL cache of games heard on the discovery group, keyed by
/// (server address, game name).
///
/// The listener task refreshes entries as announcements arrive; readers get
/// a pruned snapshot. An entry silent for [`ANNOUNCEMENT_WAIT_MS`] is
/// evicted on the next access.
#[derive(Clone, Default)]
pub struct DiscoveryCache {
    inner: Arc<Mutex<Vec<Announcement>>>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement received `at` the given instant. An existing
    /// entry for the same server and game name is refreshed in place.
    pub async fn upsert_at(&self, game: GameAnnouncement, server_addr: SocketAddr, at: Instant) {
        let mut entries = self.inner.lock().await;
        Self::prune(&mut entries, at);

        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.server_addr == server_addr && e.game.game_name == game.game_name)
        {
            existing.game = game;
            existing.last_received = at;
            return;
        }

        debug!("discovered game {:?} at {}", game.game_name, server_addr);
        entries.push(Announcement {
            game,
            server_addr,
            last_received: at,
        });
    }

    pub async fn upsert(&self, game: GameAnnouncement, server_addr: SocketAddr) {
        self.upsert_at(game, server_addr, Instant::now()).await;
    }

    /// Snapshot of the games considered alive `at` the given instant.
    pub async fn games_at(&self, at: Instant) -> Vec<Announcement> {
        let mut entries = self.inner.lock().await;
        Self::prune(&mut entries, at);
        entries.clone()
    }

    pub async fn games(&self) -> Vec<Announcement> {
        self.games_at(Instant::now()).await
    }

    fn prune(entries: &mut Vec<Announcement>, now: Instant) {
        let ttl = Duration::from_millis(ANNOUNCEMENT_WAIT_MS);
        entries.retain(|e| now.duration_since(e.last_received) <= ttl);
    }
}

/// Binds the shared discovery port and joins the multicast group.
///
/// `SO_REUSEADDR` is set before binding so several nodes on one machine can
/// listen concurrently; the group is joined on every interface rather than a
/// hard-wired one.
pub fn multicast_listener_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

/// Spawns the task that listens on the multicast group and feeds the cache.
///
/// A malformed or unexpected frame is logged and dropped; receive errors
/// back off briefly instead of killing the task.
pub fn spawn_listener(
    cache: DiscoveryCache,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<JoinHandle<()>> {
    let socket = multicast_listener_socket()?;

    Ok(tokio::spawn(async move {
        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, src)) => match decode_message(&buffer[..len]) {
                        Ok(message) => {
                            if let MessageBody::Announcement { games } = message.body {
                                for game in games {
                                    cache.upsert(game, src).await;
                                }
                            } else {
                                debug!("non-announcement frame on discovery group from {}", src);
                            }
                        }
                        Err(e) => warn!("undecodable discovery frame from {}: {}", src, e),
                    },
                    Err(e) => {
                        warn!("discovery receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }))
}
