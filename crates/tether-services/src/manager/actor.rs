//! The task that owns all connection-manager state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use tether_core::config::BridgeConfig;
use tether_core::{BridgeError, ConnectionStatus, Peer, PeerAvailability};

use super::{Command, PendingConnection, StartOptions};
use crate::bridge::{BridgeSession, CloseReason, Direction, SessionClosed, SessionId, SessionInfo};
use crate::registry::{AvailabilityDelta, PeerRegistry};
use crate::sink::EventSink;
use crate::transport::{
    BoxedPeerStream, Transport, TransportEvent, TransportEvents, TransportStart, TryConnect,
};

/// Deferred work the actor schedules for itself.
enum Timer {
    /// Report an outgoing bridge's port to the connect request `attempt`.
    ReadyDue {
        session: SessionId,
        attempt: Option<u64>,
    },
    ConnectDeadline {
        attempt: u64,
    },
}

struct Running {
    server_port: u16,
    discovering: bool,
    advertising: bool,
}

/// The single pending connect request.
struct PendingConnect {
    attempt: u64,
    peer_id: String,
    /// Outgoing session created for this request, once the transport connected.
    session: Option<SessionId>,
    reply: oneshot::Sender<Result<u16, BridgeError>>,
}

pub(super) struct ManagerActor {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    config: BridgeConfig,

    registry: PeerRegistry,
    running: Option<Running>,
    outgoing: Option<BridgeSession>,
    incoming: HashMap<SessionId, BridgeSession>,
    pending: Option<PendingConnect>,

    next_session: u64,
    next_attempt: u64,

    commands: mpsc::UnboundedReceiver<Command>,
    commands_tx: mpsc::WeakUnboundedSender<Command>,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
    closed_rx: mpsc::UnboundedReceiver<SessionClosed>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
}

impl ManagerActor {
    pub(super) fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        config: BridgeConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        commands_tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            sink,
            config,
            registry: PeerRegistry::new(),
            running: None,
            outgoing: None,
            incoming: HashMap::new(),
            pending: None,
            next_session: 1,
            next_attempt: 1,
            commands,
            commands_tx,
            closed_tx,
            closed_rx,
            timer_tx,
            timer_rx,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop();
                        break;
                    }
                },

                Some(closed) = self.closed_rx.recv() => self.on_session_closed(closed),

                Some(timer) = self.timer_rx.recv() => self.on_timer(timer),
            }
        }
        tracing::info!("connection manager exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { options, reply } => {
                let _ = reply.send(self.start(options));
            }
            Command::StopListening { reply } => {
                self.stop_listening();
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Connect { peer_id, reply } => {
                let _ = reply.send(self.connect(peer_id));
            }
            Command::Disconnect { peer_id, reply } => {
                let _ = reply.send(self.disconnect(&peer_id));
            }
            Command::KillAll { reply } => {
                let _ = reply.send(self.close_all_sessions());
            }
            Command::Sessions { reply } => {
                let mut sessions: Vec<SessionInfo> = self
                    .outgoing
                    .iter()
                    .chain(self.incoming.values())
                    .map(BridgeSession::info)
                    .collect();
                sessions.sort_by_key(|s| s.id);
                let _ = reply.send(sessions);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.registry.peers().to_vec());
            }
            Command::IsRunning { reply } => {
                let _ = reply.send(self.running.is_some());
            }
            // handled in run()
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
            Command::Transport(event) => self.on_transport_event(event).await,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn start(&mut self, options: StartOptions) -> Result<(), BridgeError> {
        if let Some(running) = self.running.as_mut() {
            if !running.discovering {
                match self.transport.start_discovery() {
                    Ok(()) => running.discovering = true,
                    Err(e) => tracing::warn!(error = %e, "failed to resume discovery"),
                }
            }
            if options.advertise && !running.advertising {
                self.transport
                    .start_advertising()
                    .map_err(|e| BridgeError::RadioUnspecifiedError(e.to_string()))?;
                running.advertising = true;
                running.server_port = options.server_port;
            }
            tracing::debug!("start: already running");
            return Ok(());
        }

        let events = self
            .commands_tx
            .upgrade()
            .map(TransportEvents::new)
            .ok_or_else(|| BridgeError::RadioUnspecifiedError("manager shutting down".into()))?;

        self.registry.clear();
        self.transport
            .start(
                TransportStart {
                    advertise: options.advertise,
                },
                events,
            )
            .map_err(|e| BridgeError::RadioUnspecifiedError(e.to_string()))?;

        let mut running = Running {
            server_port: options.server_port,
            discovering: false,
            advertising: false,
        };
        let brought_up = self.transport.start_discovery().and_then(|()| {
            running.discovering = true;
            if options.advertise {
                self.transport.start_advertising()?;
                running.advertising = true;
            }
            Ok(())
        });
        if let Err(e) = brought_up {
            tracing::warn!(error = %e, "transport failed to come up, stopping it");
            self.stop_transport(&running);
            return Err(BridgeError::RadioUnspecifiedError(e.to_string()));
        }

        tracing::info!(
            server_port = options.server_port,
            advertise = options.advertise,
            "connection manager running"
        );
        self.running = Some(running);
        Ok(())
    }

    fn stop_listening(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.discovering {
            if let Err(e) = self.transport.stop_discovery() {
                tracing::warn!(error = %e, "stop discovery failed");
            }
            running.discovering = false;
            tracing::info!("discovery stopped");
        }
    }

    fn stop(&mut self) {
        let closed = self.close_all_sessions();
        if let Some(pending) = self.pending.take() {
            tracing::debug!(peer_id = %pending.peer_id, "dropping pending connect");
        }
        if let Some(running) = self.running.take() {
            self.stop_transport(&running);
            tracing::info!(closed, "connection manager stopped");
        }
    }

    /// Transport failures are logged and otherwise ignored; local state is
    /// already clean.
    fn stop_transport(&self, running: &Running) {
        if running.discovering {
            if let Err(e) = self.transport.stop_discovery() {
                tracing::warn!(error = %e, "stop discovery failed");
            }
        }
        if running.advertising {
            if let Err(e) = self.transport.stop_advertising() {
                tracing::warn!(error = %e, "stop advertising failed");
            }
        }
        if let Err(e) = self.transport.stop() {
            tracing::warn!(error = %e, "transport stop failed");
        }
    }

    // ── Connect / disconnect ─────────────────────────────────────────────────

    fn connect(&mut self, peer_id: String) -> Result<PendingConnection, BridgeError> {
        if let Some(outgoing) = &self.outgoing {
            let current = outgoing.peer().peer_id.clone();
            return self.refuse(&peer_id, BridgeError::AlreadyConnected(current));
        }
        let Some(peer) = self.registry.find_by_id(&peer_id).cloned() else {
            return self.refuse(&peer_id, BridgeError::PeerNotFound(peer_id.clone()));
        };
        if self.running.is_none() {
            return self.refuse(&peer_id, BridgeError::NotStarted);
        }
        if self.pending.is_some() {
            return self.refuse(&peer_id, BridgeError::AlreadyAttemptingToConnect);
        }

        match self.transport.try_connect(&peer) {
            TryConnect::Connecting => {}
            TryConnect::NoSelectedDevice => {
                return self.refuse(&peer_id, BridgeError::NoSelectedDevice(peer_id.clone()));
            }
            TryConnect::AlreadyAttemptingToConnect => {
                return self.refuse(&peer_id, BridgeError::AlreadyAttemptingToConnect);
            }
            TryConnect::DeviceFetchFailed => {
                let address = peer.peer_address.clone();
                return self.refuse(&peer_id, BridgeError::DeviceFetchFailed(address));
            }
        }

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let (reply, rx) = oneshot::channel();
        self.pending = Some(PendingConnect {
            attempt,
            peer_id: peer_id.clone(),
            session: None,
            reply,
        });
        if let Some(timeout) = self.config.connect_timeout() {
            self.schedule(timeout, Timer::ConnectDeadline { attempt });
        }

        tracing::info!(%peer_id, address = %peer.peer_address, attempt, "connecting");
        Ok(PendingConnection { peer_id, rx })
    }

    fn refuse(
        &self,
        peer_id: &str,
        error: BridgeError,
    ) -> Result<PendingConnection, BridgeError> {
        tracing::debug!(%peer_id, error = %error, "connect refused");
        self.sink
            .connection_status_update(peer_id, ConnectionStatus::failed(&error));
        Err(error)
    }

    fn disconnect(&mut self, peer_id: &str) -> bool {
        let matches = self.outgoing.as_ref().is_some_and(|s| {
            peer_id.is_empty() || s.peer().peer_id.eq_ignore_ascii_case(peer_id)
        });
        if !matches {
            tracing::debug!(%peer_id, "disconnect: no matching outgoing session");
            return false;
        }
        if let Some(session) = self.outgoing.take() {
            tracing::info!(peer_id = %session.peer().peer_id, session = %session.id(), "disconnecting");
            session.close();
        }
        true
    }

    fn close_all_sessions(&mut self) -> usize {
        let mut closed = 0;
        if let Some(session) = self.outgoing.take() {
            session.close();
            closed += 1;
        }
        for (_, session) in self.incoming.drain() {
            session.close();
            closed += 1;
        }
        closed
    }

    /// Resolve the pending request and report it outward.
    fn resolve(&self, pending: PendingConnect, result: Result<u16, BridgeError>) {
        let status = match &result {
            Ok(port) => ConnectionStatus::ready(*port),
            Err(e) => ConnectionStatus::failed(e),
        };
        tracing::info!(
            peer_id = %pending.peer_id,
            attempt = pending.attempt,
            port = status.port,
            error = ?status.error,
            "connect resolved"
        );
        self.sink.connection_status_update(&pending.peer_id, status);
        let _ = pending.reply.send(result);
    }

    // ── Transport events ─────────────────────────────────────────────────────

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerSnapshot(peers) => {
                let delta = self.registry.reconcile(peers.as_deref());
                self.publish(&delta);
            }
            TransportEvent::PeerSeen(peer) => self.observe(peer),
            TransportEvent::Connected {
                stream,
                incoming,
                peer,
            } => self.on_connected(stream, incoming, peer).await,
            TransportEvent::ConnectionFailed(peer) => self.on_connection_failed(peer),
            TransportEvent::StateChanged(state) => {
                tracing::debug!(?state, "transport state changed");
            }
        }
    }

    fn observe(&mut self, peer: Peer) {
        let batch = vec![PeerAvailability::available(&peer)];
        if self.registry.observe(peer) {
            self.sink.peer_availability_changed(batch);
        }
    }

    fn publish(&self, delta: &AvailabilityDelta) {
        if delta.is_empty() {
            return;
        }
        tracing::debug!(
            available = delta.available.len(),
            unavailable = delta.unavailable.len(),
            "peer availability changed"
        );
        self.sink.peer_availability_changed(delta.to_events());
    }

    async fn on_connected(&mut self, stream: BoxedPeerStream, incoming: bool, peer: Peer) {
        let Some(server_port) = self.running.as_ref().map(|r| r.server_port) else {
            tracing::warn!(peer_id = %peer.peer_id, "connection while stopped, dropping");
            return;
        };

        // a peer that reached us before discovery did must be connectable afterwards
        self.observe(peer.clone());

        let id = SessionId::from_raw(self.next_session);
        self.next_session += 1;

        if incoming {
            let opened = BridgeSession::open(
                id,
                stream,
                Direction::Incoming,
                peer.clone(),
                server_port,
                self.config.accept_timeout(),
                self.closed_tx.clone(),
            )
            .await;
            match opened {
                Ok(session) => {
                    tracing::info!(
                        peer_id = %peer.peer_id,
                        session = %id,
                        port = session.local_port(),
                        "incoming bridge listening"
                    );
                    self.incoming.insert(id, session);
                }
                Err(e) => {
                    tracing::warn!(peer_id = %peer.peer_id, port = server_port, error = %e, "incoming bridge failed to bind");
                    self.sink.incoming_connection_failed(server_port);
                }
            }
            return;
        }

        if let Some(previous) = self.outgoing.take() {
            tracing::warn!(session = %previous.id(), "replacing existing outgoing session");
            previous.close();
        }

        let opened = BridgeSession::open(
            id,
            stream,
            Direction::Outgoing,
            peer.clone(),
            0,
            self.config.accept_timeout(),
            self.closed_tx.clone(),
        )
        .await;
        match opened {
            Ok(session) => {
                tracing::info!(
                    peer_id = %peer.peer_id,
                    session = %id,
                    port = session.local_port(),
                    "outgoing bridge listening"
                );
                self.outgoing = Some(session);
                let attempt = self.pending.as_mut().map(|p| {
                    p.session = Some(id);
                    p.attempt
                });
                let ready = Timer::ReadyDue {
                    session: id,
                    attempt,
                };
                let delay = self.config.ready_delay();
                if delay.is_zero() {
                    self.on_timer(ready);
                } else {
                    self.schedule(delay, ready);
                }
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer.peer_id, error = %e, "outgoing bridge failed to bind");
                if let Some(pending) = self.pending.take() {
                    self.resolve(pending, Err(BridgeError::Bind(e)));
                }
            }
        }
    }

    fn on_connection_failed(&mut self, peer: Peer) {
        match self.pending.take() {
            Some(pending) if pending.session.is_none() => {
                self.resolve(pending, Err(BridgeError::ConnectionFailed(peer.peer_id)));
            }
            other => {
                self.pending = other;
                tracing::debug!(peer_id = %peer.peer_id, "connection failure with no pending connect");
            }
        }
    }

    // ── Session termination ──────────────────────────────────────────────────

    /// Remove a session that ended. Sessions already removed by `disconnect`,
    /// `kill_all_connections` or `stop` are simply not found.
    fn on_session_closed(&mut self, closed: SessionClosed) {
        let SessionClosed {
            id,
            direction,
            local_port,
            reason,
        } = closed;

        match direction {
            Direction::Outgoing => {
                if self.outgoing.as_ref().is_some_and(|s| s.id() == id) {
                    self.outgoing = None;
                    tracing::info!(session = %id, %reason, "outgoing bridge closed");
                } else {
                    tracing::debug!(session = %id, "outgoing session already removed");
                }

                let bound = self.pending.as_ref().is_some_and(|p| p.session == Some(id));
                if bound {
                    if let Some(pending) = self.pending.take() {
                        let error = match reason {
                            CloseReason::Explicit => BridgeError::Cancelled,
                            CloseReason::BridgeTimeout => BridgeError::BridgeTimeout(local_port),
                            _ => BridgeError::ConnectionFailed(pending.peer_id.clone()),
                        };
                        self.resolve(pending, Err(error));
                    }
                }
            }
            Direction::Incoming => {
                if self.incoming.remove(&id).is_some() {
                    tracing::info!(session = %id, %reason, "incoming bridge closed");
                } else {
                    tracing::debug!(session = %id, "incoming session already removed");
                }
                if reason == CloseReason::BridgeTimeout {
                    self.sink.incoming_connection_failed(local_port);
                }
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn schedule(&self, delay: Duration, timer: Timer) {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        });
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ReadyDue { session, attempt } => {
                let port = match &self.outgoing {
                    Some(s) if s.id() == session => s.local_port(),
                    _ => {
                        tracing::debug!(%session, "ready signal for a session that is gone");
                        return;
                    }
                };
                let current = self.pending.as_ref().map(|p| p.attempt);
                if attempt.is_none() || current != attempt {
                    tracing::debug!(%session, port, "outgoing bridge ready, nobody waiting");
                    return;
                }
                if let Some(pending) = self.pending.take() {
                    self.resolve(pending, Ok(port));
                }
            }
            Timer::ConnectDeadline { attempt } => {
                let expired = self
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.attempt == attempt && p.session.is_none());
                if !expired {
                    return;
                }
                if let Some(pending) = self.pending.take() {
                    let error = BridgeError::ConnectTimeout(pending.peer_id.clone());
                    self.resolve(pending, Err(error));
                }
            }
        }
    }
}
