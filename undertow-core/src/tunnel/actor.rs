//! Actor implementation for the tunnel community.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use super::commands::TunnelCommand;
use super::community::{MonitoredDownload, TunnelCommunity};
use super::crypto::NodeIdentity;
use super::endpoint::{Endpoint, Inbox};
use super::handle::TunnelHandle;
use super::hidden::ServiceDirectory;
use crate::config::TunnelConfig;
use crate::constants::TUNNEL_TICK_INTERVAL;
use crate::engine::DownloadManagerHandle;
use crate::notifications::Notifier;

/// Collaborators injected into the tunnel community.
pub struct TunnelDeps {
    pub endpoint: Arc<dyn Endpoint>,
    /// Datagrams received on `endpoint`.
    pub inbox: Inbox,
    pub identity: NodeIdentity,
    pub notifier: Notifier,
    pub directory: Option<Arc<dyn ServiceDirectory>>,
}

impl TunnelDeps {
    /// Dependencies with a fresh identity and notifier, without hidden services.
    pub fn new(endpoint: Arc<dyn Endpoint>, inbox: Inbox) -> Self {
        Self {
            endpoint,
            inbox,
            identity: NodeIdentity::generate(),
            notifier: Notifier::new(),
            directory: None,
        }
    }

    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn ServiceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }
}

struct ActorState {
    community: TunnelCommunity,
    manager: Option<DownloadManagerHandle>,
}

/// Spawns the tunnel community actor and returns its handle.
///
/// The actor owns every circuit table; overlay datagrams, exit traffic,
/// commands and the once-per-second maintenance tick are serialized on it.
pub fn spawn_tunnel_community(config: TunnelConfig, deps: TunnelDeps) -> TunnelHandle {
    let (sender, receiver) = mpsc::channel(100);
    let (events, _) = broadcast::channel(256);
    let mut community = TunnelCommunity::new(
        config,
        deps.endpoint,
        deps.identity,
        deps.notifier,
        events.clone(),
    );
    if let Some(directory) = deps.directory {
        community = community.with_directory(directory);
    }

    tokio::spawn(async move {
        run_actor_loop(community, receiver, deps.inbox).await;
    });

    TunnelHandle::new(sender, events)
}

async fn run_actor_loop(
    mut community: TunnelCommunity,
    mut receiver: mpsc::Receiver<TunnelCommand>,
    mut inbox: Inbox,
) {
    tracing::info!(
        "Tunnel community listening on {} as {}",
        community.local_addr(),
        hex::encode(&community.public_key()[..8])
    );

    let Some(mut exit_rx) = community.take_exit_receiver() else {
        return;
    };
    let mut state = ActorState {
        community,
        manager: None,
    };
    let mut ticker = tokio::time::interval(TUNNEL_TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(command) => {
                    if !handle_command(&mut state, command).await {
                        break;
                    }
                }
                None => {
                    state.community.shutdown().await;
                    break;
                }
            },
            Some((from, data)) = inbox.recv() => {
                state.community.handle_datagram(from, &data).await;
            }
            Some(packet) = exit_rx.recv() => state.community.on_exit_packet(packet).await,
            _ = ticker.tick() => tick(&mut state).await,
        }
    }

    tracing::debug!("Tunnel community actor stopped");
}

async fn tick(state: &mut ActorState) {
    let now = Instant::now();
    state.community.tick(now).await;

    let Some(manager) = state.manager.clone() else {
        return;
    };
    let downloads = match manager.get_downloads(true).await {
        Ok(downloads) => downloads,
        Err(e) => {
            tracing::warn!("Stopped monitoring downloads: {}", e);
            state.manager = None;
            return;
        }
    };
    let monitored: Vec<MonitoredDownload> = downloads.iter().map(MonitoredDownload::from).collect();
    for (hops, availability) in state.community.monitor_downloads(&monitored, now).await {
        if let Err(e) = manager.update_circuit_availability(hops, availability).await {
            tracing::debug!("Circuit availability for {} hops not delivered: {}", hops, e);
        }
    }
}

/// Handles a single command. Returns false once the actor should stop.
async fn handle_command(state: &mut ActorState, command: TunnelCommand) -> bool {
    tracing::trace!("Tunnel command: {}", command.name());
    let community = &mut state.community;
    match command {
        TunnelCommand::AddPeer { peer } => community.add_peer(peer),

        TunnelCommand::BuildCircuit { hops, responder } => {
            let _ = responder.send(community.build_circuit(hops).await);
        }

        TunnelCommand::RemoveCircuit {
            circuit_id,
            responder,
        } => {
            let _ = responder.send(community.remove_circuit(circuit_id, true).await);
        }

        TunnelCommand::SendData {
            circuit_id,
            destination,
            payload,
            responder,
        } => {
            let _ = responder.send(community.send_data(circuit_id, destination, payload).await);
        }

        TunnelCommand::SendToPeer {
            addr,
            payload,
            responder,
        } => {
            let _ = responder.send(community.send_to_virtual_peer(addr, payload).await);
        }

        TunnelCommand::CreateIntroductionPoint {
            infohash,
            hops,
            responder,
        } => {
            let _ = responder.send(community.create_introduction_point(infohash, hops).await);
        }

        TunnelCommand::JoinHiddenSwarm {
            infohash,
            hops,
            responder,
        } => {
            let _ = responder.send(community.join_hidden_swarm(infohash, hops).await);
        }

        TunnelCommand::GetCircuits { responder } => {
            let _ = responder.send(community.circuits());
        }

        TunnelCommand::GetStats { responder } => {
            let _ = responder.send(community.stats());
        }

        TunnelCommand::GetBalance { responder } => {
            let _ = responder.send(community.ledger().own_balance());
        }

        TunnelCommand::MonitorDownloads { manager } => {
            tracing::debug!("Monitoring downloads for anonymous circuits");
            state.manager = Some(manager);
        }

        TunnelCommand::Shutdown { responder } => {
            community.shutdown().await;
            let _ = responder.send(());
            return false;
        }
    }
    true
}
