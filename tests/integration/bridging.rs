use crate::*;

use tether_core::{BridgeError, ConnectionStatus};
use tether_services::Direction;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn discovered_pair(air: &Arc<Air>) -> Result<(Node, Node)> {
    let mut a = Node::join(air, "a", "Alice", "00:0A");
    let b = Node::join(air, "b", "Bob", "00:0B");
    a.start().await?;
    b.start().await?;
    air.sweep();
    a.next_availability().await?;
    Ok((a, b))
}

async fn connect_via_callback(node: &Node, peer_id: &str) -> Result<ConnectionStatus> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    node.manager
        .connect_with(peer_id, move |status| {
            let _ = tx.send(status);
        })
        .await;
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .context("callback not invoked")?
        .context("callback dropped")
}

/// Two apps talk over plain localhost TCP through both bridges.
#[tokio::test]
async fn test_end_to_end_bridge() -> Result<()> {
    let air = Air::new();
    let (a, b) = discovered_pair(&air).await?;

    let status = connect_via_callback(&a, "b").await?;
    assert_eq!(status.error, None);
    let port = status.port().context("no port")?;
    assert!(port > 0);

    let outgoing = wait_for_sessions(&a.manager, 1).await?;
    assert_eq!(outgoing[0].direction, Direction::Outgoing);
    assert_eq!(outgoing[0].local_port, port);

    let incoming = wait_for_sessions(&b.manager, 1).await?;
    assert_eq!(incoming[0].direction, Direction::Incoming);
    assert_eq!(incoming[0].peer.peer_id, "a");

    let mut client = TcpStream::connect(("127.0.0.1", port)).await?;
    client.write_all(b"hello from a").await?;

    let mut server = TcpStream::connect(("127.0.0.1", incoming[0].local_port)).await?;
    let mut buf = [0u8; 12];
    server.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hello from a");

    server.write_all(b"hi back").await?;
    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hi back");

    // a's app hangs up: both bridges tear down
    drop(client);
    wait_for_sessions(&a.manager, 0).await?;
    wait_for_sessions(&b.manager, 0).await?;

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), server.read_to_end(&mut rest))
        .await
        .context("server side not closed")??;
    assert_eq!(n, 0);
    Ok(())
}

/// An unknown peer is refused at once with port -1.
#[tokio::test]
async fn test_connect_unknown_peer() -> Result<()> {
    let air = Air::new();
    let (a, _b) = discovered_pair(&air).await?;

    let status = connect_via_callback(&a, "nobody").await?;
    assert_eq!(status.port, -1);
    assert_eq!(
        status.error.as_deref(),
        Some(BridgeError::PeerNotFound("nobody".into()).to_string().as_str())
    );
    assert!(a.manager.sessions().await.is_empty());
    Ok(())
}

/// A peer that vanished after discovery fails through the pending request.
#[tokio::test]
async fn test_connect_to_vanished_peer() -> Result<()> {
    let air = Air::new();
    let (mut a, b) = discovered_pair(&air).await?;
    b.manager.stop().await;

    let pending = a.manager.connect("b").await?;
    let err = pending.port().await.unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionFailed(ref id) if id == "b"));

    let reported = a.next_event().await?;
    assert!(matches!(
        reported,
        SinkEvent::ConnectionStatusUpdate { ref peer_id, ref status } if peer_id == "b" && status.port == -1
    ));
    Ok(())
}

/// Only one outgoing bridge exists at a time.
#[tokio::test]
async fn test_single_outgoing_session() -> Result<()> {
    let air = Air::new();
    let mut a = Node::join(&air, "a", "Alice", "00:0A");
    let b = Node::join(&air, "b", "Bob", "00:0B");
    let c = Node::join(&air, "c", "Carol", "00:0C");
    for node in [&a, &b, &c] {
        node.start().await?;
    }
    air.sweep();
    a.next_availability().await?;

    let first = a.manager.connect("b").await?;
    let port = first.port().await?;

    let err = a.manager.connect("c").await.unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyConnected(ref id) if id == "b"));
    let err = a.manager.connect("b").await.unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyConnected(_)));

    let sessions = a.manager.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].local_port, port);
    assert_eq!(sessions[0].peer.peer_id, "b");

    // after disconnecting, c is reachable
    assert!(a.manager.disconnect("b").await);
    let second = a.manager.connect("c").await?;
    assert!(second.port().await? > 0);
    Ok(())
}

/// No local app shows up on the incoming side: that bridge gives up and
/// says so, and the remote outgoing bridge follows.
#[tokio::test]
async fn test_incoming_bridge_times_out() -> Result<()> {
    let air = Air::new();
    let mut a = Node::join(&air, "a", "Alice", "00:0A");
    let mut quick = bridge_config();
    quick.accept_timeout_ms = 200;
    let mut b = Node::join_with(&air, Peer::new("b", "Bob", "00:0B"), quick);
    a.start().await?;
    b.start().await?;
    air.sweep();
    a.next_availability().await?;

    let port = a.manager.connect("b").await?.port().await?;
    let _client = TcpStream::connect(("127.0.0.1", port)).await?;

    let incoming = wait_for_sessions(&b.manager, 1).await?;
    let failed = loop {
        if let SinkEvent::IncomingConnectionFailed(p) = b.next_event().await? {
            break p;
        }
    };
    assert_eq!(failed, incoming[0].local_port);

    wait_for_sessions(&b.manager, 0).await?;
    wait_for_sessions(&a.manager, 0).await?;
    Ok(())
}
