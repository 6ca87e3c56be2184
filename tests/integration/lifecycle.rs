use crate::*;

use tether_core::BridgeError;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

async fn started(air: &Arc<Air>, ids: &[&str]) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    for id in ids {
        let node = Node::join(air, id, &id.to_uppercase(), &format!("00:{id}"));
        node.start().await?;
        nodes.push(node);
    }
    air.sweep();
    Ok(nodes)
}

/// stop closes every bridge and refuses connects until started again;
/// a fresh start begins with an empty registry.
#[tokio::test]
async fn test_stop_and_restart() -> Result<()> {
    let air = Air::new();
    let mut nodes = started(&air, &["a", "b", "c"]).await?;
    let mut a = nodes.remove(0);
    a.next_availability().await?;

    // one outgoing, one incoming
    a.manager.connect("b").await?.port().await?;
    nodes[1].manager.connect("a").await?.port().await?;
    wait_for_sessions(&a.manager, 2).await?;

    a.manager.stop().await;
    a.manager.stop().await;
    assert!(!a.manager.is_running().await);
    assert!(a.manager.sessions().await.is_empty());
    wait_for_sessions(&nodes[0].manager, 0).await?;

    let err = a.manager.connect("b").await.unwrap_err();
    assert!(matches!(err, BridgeError::NotStarted));

    a.start().await?;
    assert!(a.manager.peers().await.is_empty());
    air.sweep();
    let batch = a.next_availability().await?;
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|p| p.peer_available));
    Ok(())
}

/// kill_all_connections closes everything but leaves the manager running.
#[tokio::test]
async fn test_kill_all_connections() -> Result<()> {
    let air = Air::new();
    let nodes = started(&air, &["a", "b", "c", "d"]).await?;
    let a = &nodes[0];

    for remote in &nodes[1..3] {
        remote.manager.connect("a").await?.port().await?;
    }
    a.manager.connect("d").await?.port().await?;
    wait_for_sessions(&a.manager, 3).await?;

    assert_eq!(a.manager.kill_all_connections().await, 3);
    assert!(a.manager.sessions().await.is_empty());
    assert!(a.manager.is_running().await);
    for remote in &nodes[1..] {
        wait_for_sessions(&remote.manager, 0).await?;
    }

    assert_eq!(a.manager.kill_all_connections().await, 0);
    assert!(a.manager.connect("b").await?.port().await? > 0);
    Ok(())
}

/// disconnect and the session's own teardown racing: the first one wins,
/// the second is a quiet no-op.
#[tokio::test]
async fn test_disconnect_races_remote_close() -> Result<()> {
    let air = Air::new();
    let nodes = started(&air, &["a", "b"]).await?;
    let (a, b) = (&nodes[0], &nodes[1]);

    let port = a.manager.connect("b").await?.port().await?;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await?;

    // remote end goes away while a disconnects
    let remote_close = b.manager.kill_all_connections();
    let local_close = a.manager.disconnect("B");
    let _ = tokio::join!(remote_close, local_close);

    wait_for_sessions(&a.manager, 0).await?;
    assert!(!a.manager.disconnect("b").await);
    assert!(!a.manager.disconnect("").await);

    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .context("local client not released")?;
    // EOF if the bridge had accepted the client, reset if it had not yet
    assert!(matches!(closed, Ok(0) | Err(_)));

    // the slot is free again
    assert!(a.manager.connect("b").await?.port().await? > 0);
    Ok(())
}

/// disconnect never touches incoming bridges.
#[tokio::test]
async fn test_disconnect_spares_incoming() -> Result<()> {
    let air = Air::new();
    let nodes = started(&air, &["a", "b"]).await?;
    let (a, b) = (&nodes[0], &nodes[1]);

    b.manager.connect("a").await?.port().await?;
    wait_for_sessions(&a.manager, 1).await?;

    assert!(!a.manager.disconnect("").await);
    assert!(!a.manager.disconnect("b").await);
    assert_eq!(a.manager.sessions().await.len(), 1);
    Ok(())
}
