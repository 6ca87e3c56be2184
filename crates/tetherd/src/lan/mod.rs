//! LAN transport — UDP multicast presence plus TCP links.
//!
//! Stands in for the radio: discovery is the presence listener and snapshot
//! tasks, advertising is the announce and link-accept tasks, and a connect
//! is a TCP dial. Each capability is a spawned task aborted on stop.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use tether_core::config::TetherConfig;
use tether_core::Peer;
use tether_services::{Transport, TransportError, TransportEvents, TransportStart, TryConnect};

pub mod link;
pub mod presence;

use presence::{Presence, SeenTable};

/// Everything the transport needs from config, resolved once at startup.
#[derive(Debug, Clone)]
pub struct LanSettings {
    pub peer_id: String,
    pub peer_name: String,
    pub interface_index: u32,
    pub transport_port: u16,
    pub announce_port: u16,
    pub announce_interval: Duration,
    pub snapshot_interval: Duration,
    pub peer_ttl: Duration,
    /// Bound on connect plus hello; `None` waits for the OS.
    pub dial_timeout: Option<Duration>,
}

impl LanSettings {
    pub fn from_config(config: &TetherConfig, interface_index: u32) -> Self {
        Self {
            peer_id: config.identity.resolved_id(),
            peer_name: config.identity.resolved_name(),
            interface_index,
            transport_port: config.network.transport_port,
            announce_port: config.network.announce_port,
            announce_interval: Duration::from_secs(config.discovery.announce_interval_secs.max(1)),
            snapshot_interval: Duration::from_secs(config.discovery.snapshot_interval_secs.max(1)),
            peer_ttl: Duration::from_secs(config.discovery.peer_ttl_secs),
            dial_timeout: config.bridge.connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Task {
    Listen,
    Snapshot,
    Announce,
    Accept,
}

struct Started {
    events: TransportEvents,
    listener: Arc<TcpListener>,
    tasks: HashMap<Task, JoinHandle<()>>,
}

impl Started {
    fn replace(&mut self, task: Task, handle: JoinHandle<()>) {
        if let Some(old) = self.tasks.insert(task, handle) {
            old.abort();
        }
    }

    fn abort(&mut self, task: Task) {
        if let Some(handle) = self.tasks.remove(&task) {
            handle.abort();
        }
    }
}

pub struct LanTransport {
    settings: LanSettings,
    seen: SeenTable,
    state: Mutex<Option<Started>>,
    dialing: Arc<AtomicBool>,
}

impl LanTransport {
    pub fn new(settings: LanSettings) -> Self {
        Self {
            settings,
            seen: presence::new_seen_table(),
            state: Mutex::new(None),
            dialing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.settings.peer_id
    }

    fn state(&self) -> MutexGuard<'_, Option<Started>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_started<T>(
        &self,
        f: impl FnOnce(&mut Started) -> T,
    ) -> Result<T, TransportError> {
        self.state()
            .as_mut()
            .map(f)
            .ok_or_else(|| TransportError::Other("LAN transport not started".into()))
    }

    fn local_presence(&self, listener: &TcpListener) -> Result<Presence, TransportError> {
        Ok(Presence {
            peer_id: self.settings.peer_id.clone(),
            peer_name: self.settings.peer_name.clone(),
            transport_port: listener.local_addr()?.port(),
        })
    }
}

impl Transport for LanTransport {
    fn start(&self, options: TransportStart, events: TransportEvents) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.is_some() {
            return Ok(());
        }

        let bind = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, self.settings.transport_port, 0, 0);
        let std_listener = std::net::TcpListener::bind(bind)?;
        std_listener.set_nonblocking(true)?;
        let listener = Arc::new(TcpListener::from_std(std_listener)?);

        tracing::info!(
            peer_id = %self.settings.peer_id,
            link_port = listener.local_addr()?.port(),
            advertise = options.advertise,
            "LAN transport up"
        );
        self.seen.clear();
        *state = Some(Started {
            events,
            listener,
            tasks: HashMap::new(),
        });
        Ok(())
    }

    fn stop(&self) -> Result<(), TransportError> {
        if let Some(mut started) = self.state().take() {
            for (_, handle) in started.tasks.drain() {
                handle.abort();
            }
            tracing::info!("LAN transport down");
        }
        self.seen.clear();
        Ok(())
    }

    fn start_discovery(&self) -> Result<(), TransportError> {
        let s = &self.settings;
        self.with_started(|started| {
            let listen = tokio::spawn(presence_listener(
                self.seen.clone(),
                started.events.clone(),
                s.peer_id.clone(),
                s.interface_index,
                s.announce_port,
            ));
            let snapshot = tokio::spawn(presence::snapshot_loop(
                self.seen.clone(),
                started.events.clone(),
                s.snapshot_interval,
                s.peer_ttl,
            ));
            started.replace(Task::Listen, listen);
            started.replace(Task::Snapshot, snapshot);
        })
    }

    fn stop_discovery(&self) -> Result<(), TransportError> {
        self.with_started(|started| {
            started.abort(Task::Listen);
            started.abort(Task::Snapshot);
        })
    }

    fn start_advertising(&self) -> Result<(), TransportError> {
        let s = &self.settings;
        let mut state = self.state();
        let started = state
            .as_mut()
            .ok_or_else(|| TransportError::Other("LAN transport not started".into()))?;
        let announcement = self.local_presence(&started.listener)?;

        let announce = tokio::spawn(presence_announcer(
            announcement,
            s.interface_index,
            s.announce_port,
            s.announce_interval,
        ));
        let accept = tokio::spawn(link::accept_loop(
            started.listener.clone(),
            started.events.clone(),
            s.interface_index,
        ));
        started.replace(Task::Announce, announce);
        started.replace(Task::Accept, accept);
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), TransportError> {
        self.with_started(|started| {
            started.abort(Task::Announce);
            started.abort(Task::Accept);
        })
    }

    fn try_connect(&self, peer: &Peer) -> TryConnect {
        let Ok(address) = peer.peer_address.parse::<SocketAddrV6>() else {
            tracing::warn!(peer_id = %peer.peer_id, address = %peer.peer_address, "unparsable peer address");
            return TryConnect::DeviceFetchFailed;
        };

        let state = self.state();
        let Some(started) = state.as_ref() else {
            return TryConnect::NoSelectedDevice;
        };
        let hello = match self.local_presence(&started.listener) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "link listener has no address");
                return TryConnect::NoSelectedDevice;
            }
        };
        let Some(claim) = link::DialClaim::acquire(&self.dialing) else {
            return TryConnect::AlreadyAttemptingToConnect;
        };

        tokio::spawn(link::dial(
            address,
            peer.clone(),
            hello,
            self.settings.dial_timeout,
            started.events.clone(),
            claim,
        ));
        TryConnect::Connecting
    }
}

async fn presence_listener(
    seen: SeenTable,
    events: TransportEvents,
    local_peer_id: String,
    interface_index: u32,
    port: u16,
) {
    if let Err(e) =
        presence::listen_loop(seen, events, local_peer_id, interface_index, port).await
    {
        tracing::error!(error = %e, "presence listener failed");
    }
}

async fn presence_announcer(announcement: Presence, interface_index: u32, port: u16, every: Duration) {
    if let Err(e) = presence::announce_loop(announcement, interface_index, port, every).await {
        tracing::error!(error = %e, "presence announce failed");
    }
}
