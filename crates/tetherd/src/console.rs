//! Line-oriented operator console on stdin.
//!
//! Replies go to stderr so stdout stays a clean JSON event stream.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use tether_services::{ConnectionManager, StartOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Peers,
    Sessions,
    Connect(String),
    /// Empty id = whatever outgoing session exists.
    Disconnect(String),
    Kill,
    StopListening,
    Stop,
    Start,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(String::new());
        };
        let arg = words.next();
        let command = match (verb, arg) {
            ("peers", None) => Self::Peers,
            ("sessions", None) => Self::Sessions,
            ("connect", Some(id)) => Self::Connect(id.to_string()),
            ("connect", None) => return Err("usage: connect <peer-id>".into()),
            ("disconnect", id) => Self::Disconnect(id.unwrap_or_default().to_string()),
            ("kill", None) => Self::Kill,
            ("stop-listening", None) => Self::StopListening,
            ("stop", None) => Self::Stop,
            ("start", None) => Self::Start,
            ("help", _) => Self::Help,
            _ => return Err(format!("unknown command: {line}")),
        };
        if words.next().is_some() {
            return Err(format!("too many arguments: {line}"));
        }
        Ok(command)
    }
}

const HELP: &str =
    "commands: peers | sessions | connect <id> | disconnect [id] | kill | stop-listening | stop | start";

pub struct Console {
    manager: ConnectionManager,
    start: StartOptions,
    shutdown: broadcast::Receiver<()>,
}

impl Console {
    pub fn new(
        manager: ConnectionManager,
        start: StartOptions,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            manager,
            start,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("console shutting down");
                    return;
                }

                line = lines.next_line() => match line {
                    Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                        Ok(command) => self.execute(command).await,
                        Err(e) if e.is_empty() => {}
                        Err(e) => eprintln!("{e}"),
                    },
                    Ok(None) => {
                        tracing::debug!("stdin closed, console idle");
                        let _ = self.shutdown.recv().await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        return;
                    }
                },
            }
        }
    }

    async fn execute(&self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Peers => {
                let peers = self.manager.peers().await;
                eprintln!("{} peer(s)", peers.len());
                for p in peers {
                    eprintln!("  {:<20} {:<20} {}", p.peer_id, p.peer_name, p.peer_address);
                }
            }
            ConsoleCommand::Sessions => {
                let sessions = self.manager.sessions().await;
                eprintln!("{} session(s)", sessions.len());
                for s in sessions {
                    eprintln!(
                        "  {:<6} {:<9?} {:<20} port {:<6} {:?}",
                        s.id.to_string(),
                        s.direction,
                        s.peer.peer_id,
                        s.local_port,
                        s.state
                    );
                }
            }
            ConsoleCommand::Connect(peer_id) => {
                // the outcome is reported through the event sink
                self.manager.connect_with(&peer_id, |_| {}).await;
            }
            ConsoleCommand::Disconnect(peer_id) => {
                if !self.manager.disconnect(&peer_id).await {
                    eprintln!("no matching outgoing session");
                }
            }
            ConsoleCommand::Kill => {
                let n = self.manager.kill_all_connections().await;
                eprintln!("closed {n} session(s)");
            }
            ConsoleCommand::StopListening => self.manager.stop_listening().await,
            ConsoleCommand::Stop => self.manager.stop().await,
            ConsoleCommand::Start => {
                if let Err(e) = self.manager.start(self.start).await {
                    eprintln!("start failed: {e}");
                }
            }
            ConsoleCommand::Help => eprintln!("{HELP}"),
        }
    }
}
