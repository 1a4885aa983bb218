//! Handle for communicating with the tunnel community actor.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::circuit::CircuitInfo;
use super::commands::TunnelCommand;
use super::community::TunnelEvent;
use super::{PeerRef, TunnelError, TunnelStats};
use crate::engine::DownloadManagerHandle;
use crate::torrent::InfoHash;

/// Handle for communicating with the tunnel community actor.
#[derive(Clone)]
pub struct TunnelHandle {
    sender: mpsc::Sender<TunnelCommand>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelHandle {
    pub fn new(sender: mpsc::Sender<TunnelCommand>, events: broadcast::Sender<TunnelEvent>) -> Self {
        Self { sender, events }
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Circuit lifecycle, returning data and hidden-service events.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: TunnelCommand) -> Result<(), TunnelError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| TunnelError::CommunityShutdown)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, TunnelError>>) -> TunnelCommand,
    ) -> Result<T, TunnelError> {
        let (responder, rx) = oneshot::channel();
        self.send(command(responder)).await?;
        rx.await.map_err(|_| TunnelError::CommunityShutdown)?
    }

    /// # Errors
    /// - `TunnelError::CommunityShutdown` - the actor has stopped
    pub async fn add_peer(&self, peer: PeerRef) -> Result<(), TunnelError> {
        self.send(TunnelCommand::AddPeer { peer }).await
    }

    /// Starts a data circuit and returns its id; readiness arrives as an event.
    ///
    /// # Errors
    /// - `TunnelError::TooManyCircuits` - data circuit limit reached
    /// - `TunnelError::NoCandidates` - not enough peers or no exit known
    pub async fn build_circuit(&self, hops: u8) -> Result<u32, TunnelError> {
        self.request(|responder| TunnelCommand::BuildCircuit { hops, responder })
            .await
    }

    /// Closes a local circuit, paying its hops.
    ///
    /// # Errors
    /// - `TunnelError::UnknownCircuit` - no such local circuit
    pub async fn remove_circuit(&self, circuit_id: u32) -> Result<(), TunnelError> {
        self.request(|responder| TunnelCommand::RemoveCircuit {
            circuit_id,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `TunnelError::UnknownCircuit` - no such local circuit
    /// - `TunnelError::CircuitNotReady` - the circuit is still being built
    pub async fn send_data(
        &self,
        circuit_id: u32,
        destination: SocketAddr,
        payload: Bytes,
    ) -> Result<(), TunnelError> {
        self.request(|responder| TunnelCommand::SendData {
            circuit_id,
            destination,
            payload,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `TunnelError::Protocol` - `addr` is not a linked virtual peer
    pub async fn send_to_peer(&self, addr: SocketAddr, payload: Bytes) -> Result<(), TunnelError> {
        self.request(|responder| TunnelCommand::SendToPeer {
            addr,
            payload,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `TunnelError::NoCandidates` - not enough peers
    pub async fn create_introduction_point(&self, infohash: InfoHash, hops: u8) -> Result<u32, TunnelError> {
        self.request(|responder| TunnelCommand::CreateIntroductionPoint {
            infohash,
            hops,
            responder,
        })
        .await
    }

    /// Returns the number of introduction points found.
    ///
    /// # Errors
    /// - `TunnelError::NoCandidates` - not enough peers for a rendezvous circuit
    pub async fn join_hidden_swarm(&self, infohash: InfoHash, hops: u8) -> Result<usize, TunnelError> {
        self.request(|responder| TunnelCommand::JoinHiddenSwarm {
            infohash,
            hops,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `TunnelError::CommunityShutdown` - the actor has stopped
    pub async fn get_circuits(&self) -> Result<Vec<CircuitInfo>, TunnelError> {
        let (responder, rx) = oneshot::channel();
        self.send(TunnelCommand::GetCircuits { responder }).await?;
        rx.await.map_err(|_| TunnelError::CommunityShutdown)
    }

    /// # Errors
    /// - `TunnelError::CommunityShutdown` - the actor has stopped
    pub async fn get_stats(&self) -> Result<TunnelStats, TunnelError> {
        let (responder, rx) = oneshot::channel();
        self.send(TunnelCommand::GetStats { responder }).await?;
        rx.await.map_err(|_| TunnelError::CommunityShutdown)
    }

    /// Own bandwidth balance in bytes.
    ///
    /// # Errors
    /// - `TunnelError::CommunityShutdown` - the actor has stopped
    pub async fn get_balance(&self) -> Result<i64, TunnelError> {
        let (responder, rx) = oneshot::channel();
        self.send(TunnelCommand::GetBalance { responder }).await?;
        rx.await.map_err(|_| TunnelError::CommunityShutdown)
    }

    /// Lets the community manage circuits for the manager's anonymous downloads.
    ///
    /// # Errors
    /// - `TunnelError::CommunityShutdown` - the actor has stopped
    pub async fn monitor_downloads(&self, manager: DownloadManagerHandle) -> Result<(), TunnelError> {
        self.send(TunnelCommand::MonitorDownloads { manager }).await
    }

    /// Tears down all circuits and stops the actor.
    ///
    /// # Errors
    /// - `TunnelError::CommunityShutdown` - the actor already stopped
    pub async fn shutdown(&self) -> Result<(), TunnelError> {
        let (responder, rx) = oneshot::channel();
        self.send(TunnelCommand::Shutdown { responder }).await?;
        rx.await.map_err(|_| TunnelError::CommunityShutdown)
    }
}
