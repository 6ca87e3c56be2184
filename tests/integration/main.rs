//! Tether integration test harness.
//!
//! Nodes are full `ConnectionManager`s wired to an in-memory radio. The
//! `Air` connects their transports: discovery snapshots are pushed on
//! demand with `Air::sweep`, and a connect hands each side one end of a
//! `tokio::io::duplex` pipe. Everything above the transport is real,
//! including the localhost TCP bridges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;

use tether_core::config::BridgeConfig;
use tether_core::{Peer, PeerAvailability};
use tether_services::{
    ChannelSink, ConnectionManager, SessionInfo, SinkEvent, StartOptions, Transport, TransportError,
    TransportEvents, TransportStart, TryConnect,
};

mod bridging;
mod discovery;
mod lifecycle;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Shared medium all radios transmit on.
#[derive(Default)]
pub struct Air {
    radios: Mutex<HashMap<String, Arc<Radio>>>,
}

impl Air {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn radio(&self, peer_id: &str) -> Option<Arc<Radio>> {
        self.radios.lock().unwrap().get(peer_id).cloned()
    }

    /// Deliver a discovery snapshot to every discovering radio: all other
    /// radios that are advertising.
    pub fn sweep(&self) {
        let radios: Vec<Arc<Radio>> = self.radios.lock().unwrap().values().cloned().collect();
        for listener in &radios {
            if !listener.discovering.load(Ordering::SeqCst) {
                continue;
            }
            let Some(events) = listener.events() else {
                continue;
            };
            let mut visible: Vec<Peer> = radios
                .iter()
                .filter(|r| r.me.peer_id != listener.me.peer_id)
                .filter(|r| r.advertising.load(Ordering::SeqCst))
                .map(|r| r.me.clone())
                .collect();
            visible.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
            events.peer_snapshot(Some(visible).filter(|v| !v.is_empty()));
        }
    }
}

/// In-memory transport for one node.
pub struct Radio {
    air: Arc<Air>,
    me: Peer,
    events: Mutex<Option<TransportEvents>>,
    discovering: AtomicBool,
    advertising: AtomicBool,
}

impl Radio {
    fn events(&self) -> Option<TransportEvents> {
        self.events.lock().unwrap().clone()
    }
}

impl Transport for Radio {
    fn start(&self, _: TransportStart, events: TransportEvents) -> Result<(), TransportError> {
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn stop(&self) -> Result<(), TransportError> {
        self.events.lock().unwrap().take();
        self.discovering.store(false, Ordering::SeqCst);
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start_discovery(&self) -> Result<(), TransportError> {
        self.discovering.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_discovery(&self) -> Result<(), TransportError> {
        self.discovering.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start_advertising(&self) -> Result<(), TransportError> {
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), TransportError> {
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn try_connect(&self, peer: &Peer) -> TryConnect {
        let Some(mine) = self.events() else {
            return TryConnect::NoSelectedDevice;
        };
        let theirs = self
            .air
            .radio(&peer.peer_id)
            .filter(|r| r.advertising.load(Ordering::SeqCst))
            .and_then(|r| r.events());

        let me = self.me.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            match theirs {
                Some(theirs) => {
                    let (near, far) = tokio::io::duplex(64 * 1024);
                    theirs.connected(far, true, me);
                    mine.connected(near, false, peer);
                }
                None => mine.connection_failed(peer),
            }
        });
        TryConnect::Connecting
    }
}

/// One device: a manager, its radio, and the events it reported.
pub struct Node {
    pub peer: Peer,
    pub manager: ConnectionManager,
    pub events: UnboundedReceiver<SinkEvent>,
}

pub fn bridge_config() -> BridgeConfig {
    BridgeConfig {
        accept_timeout_ms: 2_000,
        ready_delay_ms: 50,
        connect_timeout_ms: 5_000,
    }
}

impl Node {
    pub fn join(air: &Arc<Air>, peer_id: &str, name: &str, address: &str) -> Self {
        Self::join_with(air, Peer::new(peer_id, name, address), bridge_config())
    }

    pub fn join_with(air: &Arc<Air>, peer: Peer, config: BridgeConfig) -> Self {
        let radio = Arc::new(Radio {
            air: air.clone(),
            me: peer.clone(),
            events: Mutex::new(None),
            discovering: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
        });
        air.radios
            .lock()
            .unwrap()
            .insert(peer.peer_id.clone(), radio.clone());

        let (sink, events) = ChannelSink::new();
        let (manager, _task) = ConnectionManager::spawn(radio, Arc::new(sink), config);
        Self {
            peer,
            manager,
            events,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.manager
            .start(StartOptions {
                server_port: 0,
                advertise: true,
            })
            .await
            .context("start failed")
    }

    /// Wait for the next availability batch.
    pub async fn next_availability(&mut self) -> Result<Vec<PeerAvailability>> {
        loop {
            match self.next_event().await? {
                SinkEvent::PeerAvailabilityChanged(batch) => return Ok(batch),
                _ => continue,
            }
        }
    }

    pub async fn next_event(&mut self) -> Result<SinkEvent> {
        match tokio::time::timeout(Duration::from_secs(5), self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => bail!("sink closed"),
            Err(_) => bail!("no event within 5s"),
        }
    }

    /// Everything reported so far, without waiting.
    pub fn drain(&mut self) -> Vec<SinkEvent> {
        let mut out = Vec::new();
        while let Ok(e) = self.events.try_recv() {
            out.push(e);
        }
        out
    }
}

/// Wait until `manager` holds exactly `count` sessions, and return them.
pub async fn wait_for_sessions(manager: &ConnectionManager, count: usize) -> Result<Vec<SessionInfo>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let sessions = manager.sessions().await;
        if sessions.len() == count {
            return Ok(sessions);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("expected {count} session(s), have {}", sessions.len());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
