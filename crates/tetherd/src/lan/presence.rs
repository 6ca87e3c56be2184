//! LAN presence: multicast announcements standing in for radio discovery.
//!
//! Every node multicasts a small JSON `Presence` datagram to ff02::1 on the
//! chosen interface. Listeners record who they heard in a shared seen table;
//! a snapshot task periodically hands the live subset to the manager.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use tether_core::Peer;
use tether_services::TransportEvents;

/// Link-local all-nodes group.
pub const MULTICAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Announcement payload. The same shape is used as the hello on a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub peer_id: String,
    pub peer_name: String,
    /// TCP port the sender accepts links on.
    pub transport_port: u16,
}

impl Presence {
    /// The peer this presence describes, reachable at `ip`.
    pub fn to_peer(&self, ip: Ipv6Addr, interface_index: u32) -> Peer {
        let scope = if is_link_local(&ip) { interface_index } else { 0 };
        let address = SocketAddrV6::new(ip, self.transport_port, 0, scope);
        Peer::new(&self.peer_id, &self.peer_name, address.to_string())
    }
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// A peer and when it was last heard.
#[derive(Debug, Clone)]
pub struct SeenPeer {
    pub peer: Peer,
    pub last_seen: Instant,
}

/// Keyed on peer_id.
pub type SeenTable = Arc<DashMap<String, SeenPeer>>;

pub fn new_seen_table() -> SeenTable {
    Arc::new(DashMap::new())
}

// ── Announce ──────────────────────────────────────────────────────────────────

/// Multicast `presence` every `interval`. Runs until the task is aborted.
pub async fn announce_loop(
    presence: Presence,
    interface_index: u32,
    port: u16,
    interval: Duration,
) -> Result<()> {
    let socket = make_multicast_socket(interface_index)
        .context("failed to create multicast announce socket")?;
    let dest = SocketAddrV6::new(MULTICAST_ADDR, port, 0, interface_index);
    let payload = serde_json::to_vec(&presence).context("failed to encode presence")?;

    let mut interval = tokio::time::interval(interval);
    tracing::info!(
        interface_index,
        port,
        peer_id = %presence.peer_id,
        transport_port = presence.transport_port,
        "presence announce starting"
    );

    loop {
        interval.tick().await;
        match socket.send_to(&payload, &dest.into()) {
            Ok(n) => tracing::trace!(bytes = n, "presence sent"),
            Err(e) => tracing::warn!(error = %e, "presence send failed"),
        }
    }
}

fn make_multicast_socket(interface_index: u32) -> Result<Socket> {
    let socket =
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket
        .set_multicast_if_v6(interface_index)
        .context("IPV6_MULTICAST_IF")?;
    // link-local only
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    // peers on the same host should hear each other
    socket.set_multicast_loop_v6(true).context("IPV6_MULTICAST_LOOP")?;
    Ok(socket)
}

// ── Listen ────────────────────────────────────────────────────────────────────

/// Record every announcement heard on `port`, skipping our own. A peer
/// heard for the first time is also reported through `onPeerSeen`.
pub async fn listen_loop(
    seen: SeenTable,
    events: TransportEvents,
    local_peer_id: String,
    interface_index: u32,
    port: u16,
) -> Result<()> {
    let socket = make_listener_socket(interface_index, port)
        .context("failed to create multicast listener socket")?;
    let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

    let mut buf = vec![0u8; 1024];
    tracing::info!(port, "presence listener starting");

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };
        let ip = match from {
            SocketAddr::V6(v6) => *v6.ip(),
            SocketAddr::V4(_) => {
                tracing::warn!("received IPv4 datagram on IPv6 socket, ignoring");
                continue;
            }
        };

        let presence: Presence = match serde_json::from_slice(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(error = %e, from = %from, "unparsable presence datagram");
                continue;
            }
        };
        if presence.peer_id == local_peer_id {
            continue;
        }

        let peer = presence.to_peer(ip, interface_index);
        let previous = seen.insert(
            peer.peer_id.clone(),
            SeenPeer {
                peer: peer.clone(),
                last_seen: Instant::now(),
            },
        );
        if previous.map_or(true, |p| p.peer != peer) {
            tracing::debug!(peer_id = %peer.peer_id, address = %peer.peer_address, "peer heard");
            events.peer_seen(peer);
        }
    }
}

fn make_listener_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket =
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket
        .join_multicast_v6(&MULTICAST_ADDR, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Drop entries older than `ttl` and report the rest as the full visible set.
pub async fn snapshot_loop(
    seen: SeenTable,
    events: TransportEvents,
    every: Duration,
    ttl: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if events.is_closed() {
            break;
        }
        events.peer_snapshot(snapshot(&seen, ttl));
    }
}

fn snapshot(seen: &SeenTable, ttl: Duration) -> Option<Vec<Peer>> {
    let before = seen.len();
    seen.retain(|_, entry| entry.last_seen.elapsed() < ttl);
    if before != seen.len() {
        tracing::debug!(removed = before - seen.len(), "expired seen peers");
    }
    if seen.is_empty() {
        return None;
    }
    let mut peers: Vec<Peer> = seen.iter().map(|e| e.peer.clone()).collect();
    peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    Some(peers)
}

/// OS interface index for `name`.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}
