//! Command definitions for the tunnel community actor.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::circuit::CircuitInfo;
use super::{PeerRef, TunnelError, TunnelStats};
use crate::engine::DownloadManagerHandle;
use crate::torrent::InfoHash;

/// Reply channel for fallible commands.
pub type Responder<T> = oneshot::Sender<Result<T, TunnelError>>;

/// Commands processed by the tunnel community actor.
pub enum TunnelCommand {
    AddPeer {
        peer: PeerRef,
    },
    BuildCircuit {
        hops: u8,
        responder: Responder<u32>,
    },
    RemoveCircuit {
        circuit_id: u32,
        responder: Responder<()>,
    },
    SendData {
        circuit_id: u32,
        destination: SocketAddr,
        payload: Bytes,
        responder: Responder<()>,
    },
    /// Payload for a hidden-service peer, addressed by its virtual address.
    SendToPeer {
        addr: SocketAddr,
        payload: Bytes,
        responder: Responder<()>,
    },
    CreateIntroductionPoint {
        infohash: InfoHash,
        hops: u8,
        responder: Responder<u32>,
    },
    JoinHiddenSwarm {
        infohash: InfoHash,
        hops: u8,
        responder: Responder<usize>,
    },
    GetCircuits {
        responder: oneshot::Sender<Vec<CircuitInfo>>,
    },
    GetStats {
        responder: oneshot::Sender<TunnelStats>,
    },
    GetBalance {
        responder: oneshot::Sender<i64>,
    },
    /// Starts polling the download manager for anonymous downloads.
    MonitorDownloads {
        manager: DownloadManagerHandle,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

impl TunnelCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TunnelCommand::AddPeer { .. } => "add_peer",
            TunnelCommand::BuildCircuit { .. } => "build_circuit",
            TunnelCommand::RemoveCircuit { .. } => "remove_circuit",
            TunnelCommand::SendData { .. } => "send_data",
            TunnelCommand::SendToPeer { .. } => "send_to_peer",
            TunnelCommand::CreateIntroductionPoint { .. } => "create_introduction_point",
            TunnelCommand::JoinHiddenSwarm { .. } => "join_hidden_swarm",
            TunnelCommand::GetCircuits { .. } => "get_circuits",
            TunnelCommand::GetStats { .. } => "get_stats",
            TunnelCommand::GetBalance { .. } => "get_balance",
            TunnelCommand::MonitorDownloads { .. } => "monitor_downloads",
            TunnelCommand::Shutdown { .. } => "shutdown",
        }
    }
}
