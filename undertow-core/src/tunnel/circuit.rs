//! Circuits owned by this node and relay routes through it.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::time::Instant;

use super::cells::{Cell, Cookie, LAYER_CELL, LAYER_RELAY, cell_layer, relay_layer};
use super::crypto::{DhKeyPair, SessionKeys};
use super::{PeerRef, TunnelError};
use crate::torrent::InfoHash;

/// What a locally initiated circuit is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitType {
    /// Ends at an exit node that talks to the real swarm.
    Data,
    /// Seeder side; the last hop advertises a hidden service.
    IntroductionPoint,
    /// Downloader side; the last hop waits for the seeder under a cookie.
    RendezvousPoint,
    /// Seeder side; ends at the downloader's rendezvous point.
    Rendezvous,
    /// Downloader side; ends at an introduction point to deliver `introduce`.
    Lookup,
}

impl CircuitType {
    /// Whether closing the circuit settles bandwidth with a payout.
    pub fn pays_out(&self) -> bool {
        matches!(self, CircuitType::Data | CircuitType::Rendezvous)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// `create` sent, waiting for the first hop.
    Tentative,
    /// `extend` in flight through the partial circuit.
    Extending,
    Ready,
    Closing,
}

/// One established hop of a local circuit.
#[derive(Debug, Clone)]
pub struct Hop {
    pub peer: PeerRef,
    pub keys: SessionKeys,
}

/// A circuit initiated by this node.
#[derive(Debug)]
pub struct Circuit {
    pub circuit_id: u32,
    pub goal_hops: u8,
    pub ctype: CircuitType,
    pub state: CircuitState,
    pub hops: Vec<Hop>,
    /// Peers chosen up front; `hops` fills up along it.
    path: Vec<PeerRef>,
    /// Key pair offered to the hop being added.
    pending_dh: Option<DhKeyPair>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub created_at: Instant,
    /// Real infohash served or fetched through this circuit.
    pub info_hash: Option<InfoHash>,
    pub cookie: Option<Cookie>,
    /// Set once the rendezvous point linked both halves.
    pub e2e_linked: bool,
}

impl Circuit {
    pub fn new(circuit_id: u32, ctype: CircuitType, path: Vec<PeerRef>, now: Instant) -> Self {
        Self {
            circuit_id,
            goal_hops: u8::try_from(path.len()).unwrap_or(u8::MAX),
            ctype,
            state: CircuitState::Tentative,
            hops: Vec::with_capacity(path.len()),
            path,
            pending_dh: None,
            bytes_up: 0,
            bytes_down: 0,
            created_at: now,
            info_hash: None,
            cookie: None,
            e2e_linked: false,
        }
    }

    pub fn first_hop(&self) -> Option<&PeerRef> {
        self.path.first()
    }

    pub fn last_hop(&self) -> Option<&PeerRef> {
        self.hops.last().map(|hop| &hop.peer)
    }

    /// Next planned peer that still has to join.
    pub fn next_peer(&self) -> Option<&PeerRef> {
        self.path.get(self.hops.len())
    }

    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }

    pub fn uses_peer(&self, addr: &SocketAddr) -> bool {
        self.path.iter().any(|peer| peer.addr == *addr)
    }

    /// Generates the key pair for the next hop and returns its public half.
    pub fn offer_key(&mut self) -> [u8; 32] {
        let dh = DhKeyPair::generate();
        let public = dh.public_bytes();
        self.pending_dh = Some(dh);
        public
    }

    /// Session keys with the joining hop, without consuming the offer.
    pub fn pending_keys(&self, peer_dh: &[u8; 32]) -> Option<SessionKeys> {
        self.pending_dh.as_ref().map(|dh| dh.agree(peer_dh))
    }

    /// Completes the pending hop. Returns true when the circuit became ready.
    ///
    /// # Errors
    /// - `TunnelError::Protocol` - no hop was being added
    pub fn complete_hop(&mut self, peer_dh: &[u8; 32]) -> Result<bool, TunnelError> {
        let dh = self
            .pending_dh
            .take()
            .ok_or_else(|| TunnelError::protocol("unexpected key agreement"))?;
        let peer = *self
            .next_peer()
            .ok_or_else(|| TunnelError::protocol("circuit already complete"))?;
        self.hops.push(Hop {
            peer,
            keys: dh.agree(peer_dh),
        });
        if self.hops.len() == self.path.len() {
            self.state = CircuitState::Ready;
            Ok(true)
        } else {
            self.state = CircuitState::Extending;
            Ok(false)
        }
    }

    /// Onion body delivering `cell` to the hop at `target`.
    ///
    /// # Errors
    /// - `TunnelError::Protocol` - `target` is not an established hop
    /// - `TunnelError::Crypto` - sealing failed
    pub fn wrap_forward(&self, target: usize, cell: &Cell) -> Result<Vec<u8>, TunnelError> {
        let hop = self
            .hops
            .get(target)
            .ok_or_else(|| TunnelError::protocol(format!("no hop {target}")))?;
        let mut body = hop.keys.seal_forward(&cell_layer(cell))?;
        for hop in self.hops[..target].iter().rev() {
            body = hop.keys.seal_forward(&relay_layer(&body))?;
        }
        Ok(body)
    }

    /// Peels backward layers until a hop's cell is found.
    ///
    /// Returns the index of the hop that originated the cell.
    ///
    /// # Errors
    /// - `TunnelError::Crypto` - a layer failed to authenticate
    /// - `TunnelError::Protocol` - layers ran out or the cell is malformed
    pub fn unwrap_backward(&self, body: &[u8]) -> Result<(usize, Cell), TunnelError> {
        let mut current = body.to_vec();
        for (index, hop) in self.hops.iter().enumerate() {
            let plain = hop.keys.open_backward(&current)?;
            match plain.split_first() {
                Some((&LAYER_CELL, rest)) => return Ok((index, Cell::decode(rest)?)),
                Some((&LAYER_RELAY, rest)) => current = rest.to_vec(),
                _ => return Err(TunnelError::protocol("bad layer marker")),
            }
        }
        Err(TunnelError::protocol("onion deeper than circuit"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDirection {
    /// Away from the initiator.
    Forward,
    /// Towards the initiator.
    Backward,
}

/// Where a relay sends cells that arrive on a circuit id.
///
/// A relay registers two routes per joined circuit: the initiator-side id
/// routes forward, the id it chose for the next hop routes backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRoute {
    /// Joined circuit whose keys apply.
    pub circuit_id: u32,
    pub to_cid: u32,
    pub to_peer: SocketAddr,
    pub direction: RouteDirection,
}

/// Serializable view of a local circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitInfo {
    pub circuit_id: u32,
    pub ctype: CircuitType,
    pub state: CircuitState,
    pub goal_hops: u8,
    pub hops: usize,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub info_hash: Option<InfoHash>,
}

impl From<&Circuit> for CircuitInfo {
    fn from(circuit: &Circuit) -> Self {
        Self {
            circuit_id: circuit.circuit_id,
            ctype: circuit.ctype,
            state: circuit.state,
            goal_hops: circuit.goal_hops,
            hops: circuit.hops.len(),
            bytes_up: circuit.bytes_up,
            bytes_down: circuit.bytes_down,
            info_hash: circuit.info_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerRef {
        PeerRef::new(SocketAddr::from(([127, 0, 0, 1], port)), [port as u8; 32], false)
    }

    /// Builds a circuit and the keys each relay would hold.
    fn built(hops: u16) -> (Circuit, Vec<SessionKeys>) {
        let path = (1..=hops).map(|p| peer(9000 + p)).collect();
        let mut circuit = Circuit::new(1, CircuitType::Data, path, Instant::now());
        let mut relay_keys = Vec::new();
        for _ in 0..hops {
            let offer = circuit.offer_key();
            let relay = DhKeyPair::generate();
            relay_keys.push(relay.agree(&offer));
            circuit.complete_hop(&relay.public_bytes()).unwrap();
        }
        (circuit, relay_keys)
    }

    #[test]
    fn test_hop_completion_walks_states() {
        let path = vec![peer(1), peer(2)];
        let mut circuit = Circuit::new(7, CircuitType::Data, path, Instant::now());
        assert_eq!(circuit.goal_hops, 2);
        assert!(circuit.complete_hop(&[1; 32]).is_err());

        circuit.offer_key();
        assert!(!circuit.complete_hop(&DhKeyPair::generate().public_bytes()).unwrap());
        assert_eq!(circuit.state, CircuitState::Extending);
        assert_eq!(circuit.next_peer(), Some(&peer(2)));

        circuit.offer_key();
        assert!(circuit.complete_hop(&DhKeyPair::generate().public_bytes()).unwrap());
        assert!(circuit.is_ready());
        assert_eq!(circuit.last_hop(), Some(&peer(2)));
    }

    #[test]
    fn test_forward_onion_peels_hop_by_hop() {
        let (circuit, relays) = built(3);
        let cell = Cell::Destroy { reason: 9 };
        let mut body = circuit.wrap_forward(2, &cell).unwrap();

        for keys in &relays[..2] {
            let plain = keys.open_forward(&body).unwrap();
            assert_eq!(plain[0], LAYER_RELAY);
            body = plain[1..].to_vec();
        }
        let plain = relays[2].open_forward(&body).unwrap();
        assert_eq!(plain[0], LAYER_CELL);
        assert_eq!(Cell::decode(&plain[1..]).unwrap(), cell);
    }

    #[test]
    fn test_backward_onion_reports_origin_hop() {
        let (circuit, relays) = built(3);
        let cell = Cell::BalanceRequest { circuit_id: 42 };
        // Hop 1 answers, hop 0 adds its relay layer.
        let inner = relays[1].seal_backward(&cell_layer(&cell)).unwrap();
        let outer = relays[0].seal_backward(&relay_layer(&inner)).unwrap();
        assert_eq!(circuit.unwrap_backward(&outer).unwrap(), (1, cell));

        let foreign = SessionKeys::derive(&[1; 32]).seal_backward(b"\x01").unwrap();
        assert!(circuit.unwrap_backward(&foreign).is_err());
    }
}
