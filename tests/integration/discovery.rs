use crate::*;

fn available_ids(batch: &[PeerAvailability]) -> Vec<(&str, bool)> {
    batch
        .iter()
        .map(|a| (a.peer_identifier.as_str(), a.peer_available))
        .collect()
}

/// Discovered peers are announced once, and disappear when they stop.
#[tokio::test]
async fn test_discovery_announces_changes_only() -> Result<()> {
    let air = Air::new();
    let mut a = Node::join(&air, "a", "Alice", "00:0A");
    let b = Node::join(&air, "b", "Bob", "00:0B");
    let c = Node::join(&air, "c", "Carol", "00:0C");
    for node in [&a, &b, &c] {
        node.start().await?;
    }

    air.sweep();
    let batch = a.next_availability().await?;
    assert_eq!(available_ids(&batch), [("b", true), ("c", true)]);
    assert_eq!(batch[0].peer_name, "Bob");

    // same view again: nothing to report
    air.sweep();
    assert_eq!(a.manager.peers().await.len(), 2);
    assert!(
        a.drain()
            .iter()
            .all(|e| !matches!(e, SinkEvent::PeerAvailabilityChanged(_))),
        "unchanged snapshot produced an event"
    );

    c.manager.stop().await;
    air.sweep();
    let batch = a.next_availability().await?;
    assert_eq!(available_ids(&batch), [("c", false)]);

    b.manager.stop().await;
    air.sweep();
    let batch = a.next_availability().await?;
    assert_eq!(available_ids(&batch), [("b", false)]);
    assert!(a.manager.peers().await.is_empty());
    Ok(())
}

/// Discovery stops with stop_listening; the registry keeps what it knew.
#[tokio::test]
async fn test_stop_listening_freezes_registry() -> Result<()> {
    let air = Air::new();
    let mut a = Node::join(&air, "a", "Alice", "00:0A");
    let b = Node::join(&air, "b", "Bob", "00:0B");
    a.start().await?;
    b.start().await?;

    air.sweep();
    a.next_availability().await?;

    a.manager.stop_listening().await;
    b.manager.stop().await;
    air.sweep();

    assert_eq!(a.manager.peers().await.len(), 1);
    assert!(a.drain().is_empty());
    assert!(a.manager.is_running().await);

    // start again resumes discovery
    a.start().await?;
    air.sweep();
    let batch = a.next_availability().await?;
    assert_eq!(available_ids(&batch), [("b", false)]);
    Ok(())
}

/// A peer that connects in before discovery found it becomes available,
/// and can be connected back to.
#[tokio::test]
async fn test_incoming_peer_becomes_available() -> Result<()> {
    let air = Air::new();
    let mut a = Node::join(&air, "a", "Alice", "00:0A");
    let mut b = Node::join(&air, "b", "Bob", "00:0B");
    a.start().await?;
    b.start().await?;
    a.manager.stop_listening().await;

    air.sweep();
    b.next_availability().await?;
    let pending = b.manager.connect("a").await?;

    let batch = a.next_availability().await?;
    assert_eq!(available_ids(&batch), [("b", true)]);
    let sessions = wait_for_sessions(&a.manager, 1).await?;
    assert_eq!(sessions[0].peer.peer_id, "b");
    assert_eq!(sessions[0].peer.peer_address, "00:0B");

    pending.port().await?;

    // only an outgoing session blocks a's own connect
    let back = a.manager.connect("b").await?;
    assert!(back.port().await? > 0);
    Ok(())
}
