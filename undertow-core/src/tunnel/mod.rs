//! Anonymous tunnel layer
//!
//! Onion-routed circuits over a UDP overlay. Initiators build circuits hop
//! by hop with one X25519 agreement per hop; relays peel or add one layer
//! and forward; exit nodes bridge data cells to real BitTorrent peers.
//! Joining a circuit as relay or exit goes through the slot-based
//! admission scheduler, and closing a data circuit settles bandwidth
//! credit with chained payout blocks.

pub mod actor;
pub mod admission;
pub mod cells;
pub mod circuit;
pub mod commands;
pub mod community;
pub mod crypto;
pub mod endpoint;
pub mod exit;
pub mod handle;
pub mod hidden;
pub mod ledger;
pub mod payout;

use std::net::SocketAddr;

use serde::Serialize;

pub use actor::{TunnelDeps, spawn_tunnel_community};
pub use admission::{Competition, SlotAllocator};
pub use cells::{Cell, Datagram};
pub use circuit::{Circuit, CircuitInfo, CircuitState, CircuitType, RelayRoute, RouteDirection};
pub use commands::TunnelCommand;
pub use community::{MonitoredDownload, TunnelCommunity, TunnelEvent};
pub use crypto::{DhKeyPair, NodeIdentity, SessionKeys};
pub use endpoint::{Endpoint, Inbox, MemoryEndpoint, MemoryNetwork, UdpEndpoint};
pub use exit::{ExitPacket, ExitSocket};
pub use handle::TunnelHandle;
pub use hidden::{
    IntroPointInfo, MemoryDirectory, ServiceDirectory, VirtualPeers, is_virtual, lookup_info_hash,
};
pub use ledger::{Ledger, LedgerBlock, LedgerError, Transaction};

use crate::ErrorKind;

/// Errors raised by the tunnel layer.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Cryptographic failure: {message}")]
    Crypto { message: String },

    #[error("Unknown circuit {circuit_id}")]
    UnknownCircuit { circuit_id: u32 },

    #[error("Circuit {circuit_id} is not ready")]
    CircuitNotReady { circuit_id: u32 },

    #[error("Not enough candidates for a {hops}-hop circuit")]
    NoCandidates { hops: u8 },

    #[error("Circuit limit of {limit} reached")]
    TooManyCircuits { limit: usize },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel community has shut down")]
    CommunityShutdown,
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Protocol { .. } | TunnelError::UnknownCircuit { .. } => ErrorKind::Protocol,
            TunnelError::Crypto { .. } | TunnelError::Ledger(_) => ErrorKind::Integrity,
            TunnelError::CircuitNotReady { .. } | TunnelError::Io(_) => ErrorKind::TransientIo,
            TunnelError::NoCandidates { .. } | TunnelError::TooManyCircuits { .. } => {
                ErrorKind::ResourceLimit
            }
            TunnelError::CommunityShutdown => ErrorKind::Fatal,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        TunnelError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn crypto(message: impl Into<String>) -> Self {
        TunnelError::Crypto {
            message: message.into(),
        }
    }
}

/// Another overlay node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub addr: SocketAddr,
    /// Ed25519 identity, used as the ledger counterparty.
    pub public_key: [u8; 32],
    pub exit_capable: bool,
}

impl PeerRef {
    pub fn new(addr: SocketAddr, public_key: [u8; 32], exit_capable: bool) -> Self {
        Self {
            addr,
            public_key,
            exit_capable,
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStats {
    /// Cells dropped for protocol or crypto violations.
    pub dropped_cells: u64,
    pub bytes_relayed: u64,
    pub circuits_built: u64,
    pub circuits_joined: u64,
    pub admissions_denied: u64,
    pub payouts_sent: u64,
}
