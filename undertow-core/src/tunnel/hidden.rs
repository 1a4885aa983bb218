//! Hidden-service plumbing: lookup infohashes, the directory where
//! introduction points are announced, and virtual peer addresses.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::{PeerRef, TunnelError};
use crate::constants::{LOOKUP_INFOHASH_PREFIX, TUNNEL_SENTINEL_IP, VIRTUAL_PORT_MIN};
use crate::torrent::InfoHash;

/// Infohash under which a hidden torrent's introduction points are announced.
///
/// Stable across peers and unrelated to the real infohash, so the DHT never
/// learns which torrent is being served.
pub fn lookup_info_hash(infohash: &InfoHash) -> InfoHash {
    let mut hasher = Sha1::new();
    hasher.update(LOOKUP_INFOHASH_PREFIX);
    hasher.update(infohash.to_hex().as_bytes());
    InfoHash::new(hasher.finalize().into())
}

/// Where to reach one introduction point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntroPointInfo {
    pub addr: SocketAddr,
    pub public_key: [u8; 32],
}

impl IntroPointInfo {
    pub fn peer(&self) -> PeerRef {
        PeerRef::new(self.addr, self.public_key, false)
    }
}

/// Announcement store for introduction points, keyed by lookup infohash.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// # Errors
    /// - `TunnelError::Io` - the directory could not be reached
    async fn announce(&self, service: InfoHash, intro: IntroPointInfo) -> Result<(), TunnelError>;

    async fn withdraw(&self, service: InfoHash, intro: IntroPointInfo);

    /// # Errors
    /// - `TunnelError::Io` - the directory could not be reached
    async fn lookup(&self, service: InfoHash) -> Result<Vec<IntroPointInfo>, TunnelError>;
}

/// Shared in-process directory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    entries: Arc<Mutex<HashMap<InfoHash, Vec<IntroPointInfo>>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceDirectory for MemoryDirectory {
    async fn announce(&self, service: InfoHash, intro: IntroPointInfo) -> Result<(), TunnelError> {
        let mut entries = self.entries.lock();
        let intros = entries.entry(service).or_default();
        if !intros.contains(&intro) {
            intros.push(intro);
        }
        Ok(())
    }

    async fn withdraw(&self, service: InfoHash, intro: IntroPointInfo) {
        let mut entries = self.entries.lock();
        if let Some(intros) = entries.get_mut(&service) {
            intros.retain(|known| *known != intro);
            if intros.is_empty() {
                entries.remove(&service);
            }
        }
    }

    async fn lookup(&self, service: InfoHash) -> Result<Vec<IntroPointInfo>, TunnelError> {
        Ok(self.entries.lock().get(&service).cloned().unwrap_or_default())
    }
}

/// Maps end-to-end circuits to `1.1.1.1:<port>` addresses the engine can dial.
#[derive(Debug, Default)]
pub struct VirtualPeers {
    by_circuit: HashMap<u32, u16>,
    by_port: HashMap<u16, u32>,
}

impl VirtualPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of `circuit_id`, allocating a port on first use.
    ///
    /// Returns `None` once every port in the range is taken.
    pub fn assign(&mut self, circuit_id: u32) -> Option<SocketAddr> {
        if let Some(port) = self.by_circuit.get(&circuit_id) {
            return Some(sentinel(*port));
        }
        let span = u32::from(u16::MAX - VIRTUAL_PORT_MIN) + 1;
        let start = circuit_id % span;
        let port = (0..span)
            .map(|offset| VIRTUAL_PORT_MIN + ((start + offset) % span) as u16)
            .find(|port| !self.by_port.contains_key(port))?;
        self.by_circuit.insert(circuit_id, port);
        self.by_port.insert(port, circuit_id);
        Some(sentinel(port))
    }

    pub fn address(&self, circuit_id: u32) -> Option<SocketAddr> {
        self.by_circuit.get(&circuit_id).map(|port| sentinel(*port))
    }

    /// Circuit behind a virtual address.
    pub fn circuit(&self, addr: &SocketAddr) -> Option<u32> {
        if !is_virtual(addr) {
            return None;
        }
        self.by_port.get(&addr.port()).copied()
    }

    pub fn release(&mut self, circuit_id: u32) {
        if let Some(port) = self.by_circuit.remove(&circuit_id) {
            self.by_port.remove(&port);
        }
    }
}

fn sentinel(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::from(TUNNEL_SENTINEL_IP), port))
}

/// True for addresses handed out by [`VirtualPeers`].
pub fn is_virtual(addr: &SocketAddr) -> bool {
    addr.ip() == Ipv4Addr::from(TUNNEL_SENTINEL_IP) && addr.port() >= VIRTUAL_PORT_MIN
}
