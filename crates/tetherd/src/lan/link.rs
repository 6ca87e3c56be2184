//! LAN links: TCP streams standing in for radio sockets.
//!
//! The dialing side opens the stream and writes a hello (a `Presence`
//! framed by a big-endian u16 length) so the accepting side knows who
//! connected. After the hello the stream carries application bytes only.

use std::future::Future;
use std::net::{SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tether_core::Peer;
use tether_services::TransportEvents;

use super::presence::Presence;

/// Upper bound on an encoded hello.
const MAX_HELLO_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("hello length {0} exceeds 1024 bytes")]
    TooLong(usize),
    #[error("malformed hello: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("link I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("link setup timed out after {0:?}")]
    TimedOut(Duration),
}

/// Hold on the single in-flight dial. Dropping it frees the slot.
#[derive(Debug)]
pub struct DialClaim(Arc<AtomicBool>);

impl DialClaim {
    /// `None` while another claim on `slot` is alive.
    pub fn acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        if slot.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(slot.clone()))
        }
    }
}

impl Drop for DialClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub async fn write_hello<W>(stream: &mut W, hello: &Presence) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(hello)?;
    let len = u16::try_from(body.len())
        .ok()
        .filter(|&n| usize::from(n) <= MAX_HELLO_LEN)
        .ok_or(LinkError::TooLong(body.len()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_hello<R>(stream: &mut R) -> Result<Presence, LinkError>
where
    R: AsyncRead + Unpin,
{
    let len = usize::from(stream.read_u16().await?);
    if len > MAX_HELLO_LEN {
        return Err(LinkError::TooLong(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Accept links and hand each one to the manager as an incoming connection.
/// Runs until the task is aborted.
pub async fn accept_loop(listener: Arc<TcpListener>, events: TransportEvents, interface_index: u32) {
    tracing::info!(
        addr = ?listener.local_addr().ok(),
        "link listener accepting"
    );
    loop {
        let (mut stream, remote) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "link accept failed");
                continue;
            }
        };
        let events = events.clone();
        tokio::spawn(async move {
            let hello = match read_hello(&mut stream).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(%remote, error = %e, "dropping link without hello");
                    return;
                }
            };
            let ip = match remote {
                SocketAddr::V6(v6) => v6.ip().to_owned(),
                SocketAddr::V4(v4) => v4.ip().to_ipv6_mapped(),
            };
            let peer = hello.to_peer(ip, interface_index);
            tracing::info!(peer_id = %peer.peer_id, %remote, "incoming link");
            events.connected(stream, true, peer);
        });
    }
}

/// Connect and write the hello, giving up after `limit` if one is set.
pub async fn open_link(
    address: SocketAddrV6,
    hello: &Presence,
    limit: Option<Duration>,
) -> Result<TcpStream, LinkError> {
    within(limit, async {
        let mut stream = TcpStream::connect(address).await?;
        write_hello(&mut stream, hello).await?;
        Ok(stream)
    })
    .await
}

async fn within<T>(
    limit: Option<Duration>,
    work: impl Future<Output = Result<T, LinkError>>,
) -> Result<T, LinkError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| LinkError::TimedOut(limit))?,
        None => work.await,
    }
}

/// Dial `peer`, introduce ourselves, and report the outcome. The claim is
/// released before the outcome is reported so a retry is never refused.
pub async fn dial(
    address: SocketAddrV6,
    peer: Peer,
    hello: Presence,
    limit: Option<Duration>,
    events: TransportEvents,
    claim: DialClaim,
) {
    let result = open_link(address, &hello, limit).await;
    drop(claim);

    match result {
        Ok(stream) => {
            tracing::info!(peer_id = %peer.peer_id, %address, "outgoing link up");
            events.connected(stream, false, peer);
        }
        Err(e) => {
            tracing::warn!(peer_id = %peer.peer_id, %address, error = %e, "dial failed");
            events.connection_failed(peer);
        }
    }
}
