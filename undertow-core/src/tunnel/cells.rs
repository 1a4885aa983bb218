//! Overlay datagram and cell serialization.
//!
//! Datagram layout: `"UT" | circuit_id:u32 | kind:u8 | body`.
//!
//! * `Plain` bodies are one cell, used between adjacent nodes.
//! * `Onion` bodies are sealed layers travelling along a circuit. Every
//!   opened layer starts with a marker: [`LAYER_RELAY`] means the rest is
//!   another layer for the next hop, [`LAYER_CELL`] means the rest is a
//!   cell for whoever opened it.
//! * `Handshake` bodies are `dh_key(32) | sealed cell`, sent by a joining
//!   hop before the initiator knows its key.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes};

use super::TunnelError;
use super::ledger::LedgerBlock;
use crate::constants::MAX_CELL_SIZE;
use crate::torrent::InfoHash;

pub const DATAGRAM_MAGIC: [u8; 2] = *b"UT";
const HEADER_LEN: usize = 2 + 4 + 1;

pub const LAYER_RELAY: u8 = 0;
pub const LAYER_CELL: u8 = 1;

/// Rendezvous cookie shared by both ends of a hidden-service link.
pub type Cookie = [u8; 20];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Plain { circuit_id: u32, cell: Cell },
    Onion { circuit_id: u32, body: Bytes },
    Handshake { circuit_id: u32, dh_key: [u8; 32], body: Bytes },
}

impl Datagram {
    pub fn circuit_id(&self) -> u32 {
        match self {
            Datagram::Plain { circuit_id, .. }
            | Datagram::Onion { circuit_id, .. }
            | Datagram::Handshake { circuit_id, .. } => *circuit_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.put_slice(&DATAGRAM_MAGIC);
        buf.put_u32(self.circuit_id());
        match self {
            Datagram::Plain { cell, .. } => {
                buf.put_u8(0);
                buf.put_slice(&cell.encode());
            }
            Datagram::Onion { body, .. } => {
                buf.put_u8(1);
                buf.put_slice(body);
            }
            Datagram::Handshake { dh_key, body, .. } => {
                buf.put_u8(2);
                buf.put_slice(dh_key);
                buf.put_slice(body);
            }
        }
        buf
    }

    /// # Errors
    /// - `TunnelError::Protocol` - bad magic, oversized, truncated or unknown kind
    pub fn decode(data: &[u8]) -> Result<Self, TunnelError> {
        if data.len() > MAX_CELL_SIZE {
            return Err(TunnelError::protocol("datagram too large"));
        }
        if data.len() < HEADER_LEN || data[..2] != DATAGRAM_MAGIC {
            return Err(TunnelError::protocol("not an overlay datagram"));
        }
        let mut buf = &data[2..];
        let circuit_id = buf.get_u32();
        match buf.get_u8() {
            0 => Ok(Datagram::Plain {
                circuit_id,
                cell: Cell::decode(buf)?,
            }),
            1 => Ok(Datagram::Onion {
                circuit_id,
                body: Bytes::copy_from_slice(buf),
            }),
            2 => {
                if buf.len() < 32 {
                    return Err(TunnelError::protocol("handshake too short"));
                }
                let dh_key = take_array::<32>(&mut buf);
                Ok(Datagram::Handshake {
                    circuit_id,
                    dh_key,
                    body: Bytes::copy_from_slice(buf),
                })
            }
            kind => Err(TunnelError::protocol(format!("unknown datagram kind {kind}"))),
        }
    }
}

/// Control and data messages carried on circuits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// `relayed` is set when a relay forwards an extend on the initiator's behalf.
    Create { dh_key: [u8; 32], relayed: bool },
    Created { dh_key: [u8; 32] },
    /// `node_key` is the next hop's identity, needed to link payouts.
    Extend {
        node: SocketAddr,
        node_key: [u8; 32],
        dh_key: [u8; 32],
    },
    Extended { dh_key: [u8; 32] },
    Data {
        destination: SocketAddr,
        origin: SocketAddr,
        payload: Bytes,
    },
    Destroy { reason: u16 },
    BalanceRequest { circuit_id: u32 },
    BalanceResponse { circuit_id: u32, block: LedgerBlock },
    RelayBalanceRequest { circuit_id: u32 },
    RelayBalanceResponse { circuit_id: u32, block: LedgerBlock },
    Payout {
        block: LedgerBlock,
        circuit_id: u32,
        base_amount: u32,
    },
    EstablishIntro { service: InfoHash },
    IntroEstablished { service: InfoHash },
    EstablishRendezvous { cookie: Cookie },
    RendezvousEstablished { cookie: Cookie },
    Introduce {
        service: InfoHash,
        cookie: Cookie,
        rendezvous: SocketAddr,
        rendezvous_key: [u8; 32],
    },
    LinkE2e { cookie: Cookie },
    LinkedE2e { cookie: Cookie },
}

impl Cell {
    pub fn type_id(&self) -> u8 {
        match self {
            Cell::Create { .. } => 1,
            Cell::Created { .. } => 2,
            Cell::Extend { .. } => 3,
            Cell::Extended { .. } => 4,
            Cell::Data { .. } => 5,
            Cell::Destroy { .. } => 6,
            Cell::BalanceRequest { .. } => 7,
            Cell::BalanceResponse { .. } => 8,
            Cell::RelayBalanceRequest { .. } => 9,
            Cell::RelayBalanceResponse { .. } => 10,
            Cell::Payout { .. } => 11,
            Cell::EstablishIntro { .. } => 12,
            Cell::IntroEstablished { .. } => 13,
            Cell::EstablishRendezvous { .. } => 14,
            Cell::RendezvousEstablished { .. } => 15,
            Cell::Introduce { .. } => 16,
            Cell::LinkE2e { .. } => 17,
            Cell::LinkedE2e { .. } => 18,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Cell::Create { .. } => "create",
            Cell::Created { .. } => "created",
            Cell::Extend { .. } => "extend",
            Cell::Extended { .. } => "extended",
            Cell::Data { .. } => "data",
            Cell::Destroy { .. } => "destroy",
            Cell::BalanceRequest { .. } => "balance-request",
            Cell::BalanceResponse { .. } => "balance-response",
            Cell::RelayBalanceRequest { .. } => "relay-balance-request",
            Cell::RelayBalanceResponse { .. } => "relay-balance-response",
            Cell::Payout { .. } => "payout",
            Cell::EstablishIntro { .. } => "establish-intro",
            Cell::IntroEstablished { .. } => "intro-established",
            Cell::EstablishRendezvous { .. } => "establish-rendezvous",
            Cell::RendezvousEstablished { .. } => "rendezvous-established",
            Cell::Introduce { .. } => "introduce",
            Cell::LinkE2e { .. } => "link-e2e",
            Cell::LinkedE2e { .. } => "linked-e2e",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(self.type_id());

        match self {
            Cell::Create { dh_key, relayed } => {
                buf.put_slice(dh_key);
                buf.put_u8(u8::from(*relayed));
            }
            Cell::Created { dh_key } | Cell::Extended { dh_key } => buf.put_slice(dh_key),
            Cell::Extend {
                node,
                node_key,
                dh_key,
            } => {
                put_addr(&mut buf, node);
                buf.put_slice(node_key);
                buf.put_slice(dh_key);
            }
            Cell::Data {
                destination,
                origin,
                payload,
            } => {
                put_addr(&mut buf, destination);
                put_addr(&mut buf, origin);
                buf.put_slice(payload);
            }
            Cell::Destroy { reason } => buf.put_u16(*reason),
            Cell::BalanceRequest { circuit_id } | Cell::RelayBalanceRequest { circuit_id } => {
                buf.put_u32(*circuit_id);
            }
            Cell::BalanceResponse { circuit_id, block }
            | Cell::RelayBalanceResponse { circuit_id, block } => {
                buf.put_u32(*circuit_id);
                buf.put_slice(&block.encode());
            }
            Cell::Payout {
                block,
                circuit_id,
                base_amount,
            } => {
                buf.put_slice(&block.encode());
                buf.put_u32(*circuit_id);
                buf.put_u32(*base_amount);
            }
            Cell::EstablishIntro { service } | Cell::IntroEstablished { service } => {
                buf.put_slice(service.as_bytes());
            }
            Cell::EstablishRendezvous { cookie }
            | Cell::RendezvousEstablished { cookie }
            | Cell::LinkE2e { cookie }
            | Cell::LinkedE2e { cookie } => buf.put_slice(cookie),
            Cell::Introduce {
                service,
                cookie,
                rendezvous,
                rendezvous_key,
            } => {
                buf.put_slice(service.as_bytes());
                buf.put_slice(cookie);
                put_addr(&mut buf, rendezvous);
                buf.put_slice(rendezvous_key);
            }
        }

        buf
    }

    /// # Errors
    /// - `TunnelError::Protocol` - unknown type or malformed payload
    pub fn decode(data: &[u8]) -> Result<Self, TunnelError> {
        let mut buf = data;
        need(&buf, 1)?;
        let type_id = buf.get_u8();

        let cell = match type_id {
            1 => {
                need(&buf, 33)?;
                Cell::Create {
                    dh_key: take_array(&mut buf),
                    relayed: buf.get_u8() != 0,
                }
            }
            2 => {
                need(&buf, 32)?;
                Cell::Created {
                    dh_key: take_array(&mut buf),
                }
            }
            3 => {
                let node = get_addr(&mut buf)?;
                need(&buf, 64)?;
                Cell::Extend {
                    node,
                    node_key: take_array(&mut buf),
                    dh_key: take_array(&mut buf),
                }
            }
            4 => {
                need(&buf, 32)?;
                Cell::Extended {
                    dh_key: take_array(&mut buf),
                }
            }
            5 => {
                let destination = get_addr(&mut buf)?;
                let origin = get_addr(&mut buf)?;
                let payload = Bytes::copy_from_slice(buf);
                buf.advance(buf.len());
                Cell::Data {
                    destination,
                    origin,
                    payload,
                }
            }
            6 => {
                need(&buf, 2)?;
                Cell::Destroy {
                    reason: buf.get_u16(),
                }
            }
            7 | 9 => {
                need(&buf, 4)?;
                let circuit_id = buf.get_u32();
                if type_id == 7 {
                    Cell::BalanceRequest { circuit_id }
                } else {
                    Cell::RelayBalanceRequest { circuit_id }
                }
            }
            8 | 10 => {
                need(&buf, 4)?;
                let circuit_id = buf.get_u32();
                let block = decode_block(&mut buf)?;
                if type_id == 8 {
                    Cell::BalanceResponse { circuit_id, block }
                } else {
                    Cell::RelayBalanceResponse { circuit_id, block }
                }
            }
            11 => {
                let block = decode_block(&mut buf)?;
                need(&buf, 8)?;
                Cell::Payout {
                    block,
                    circuit_id: buf.get_u32(),
                    base_amount: buf.get_u32(),
                }
            }
            12 | 13 => {
                need(&buf, 20)?;
                let service = InfoHash::new(take_array(&mut buf));
                if type_id == 12 {
                    Cell::EstablishIntro { service }
                } else {
                    Cell::IntroEstablished { service }
                }
            }
            14 | 15 | 17 | 18 => {
                need(&buf, 20)?;
                let cookie = take_array(&mut buf);
                match type_id {
                    14 => Cell::EstablishRendezvous { cookie },
                    15 => Cell::RendezvousEstablished { cookie },
                    17 => Cell::LinkE2e { cookie },
                    _ => Cell::LinkedE2e { cookie },
                }
            }
            16 => {
                need(&buf, 40)?;
                let service = InfoHash::new(take_array(&mut buf));
                let cookie = take_array(&mut buf);
                let rendezvous = get_addr(&mut buf)?;
                need(&buf, 32)?;
                Cell::Introduce {
                    service,
                    cookie,
                    rendezvous,
                    rendezvous_key: take_array(&mut buf),
                }
            }
            _ => {
                return Err(TunnelError::protocol(format!("unknown cell type {type_id}")));
            }
        };

        if buf.has_remaining() {
            return Err(TunnelError::protocol(format!(
                "{} trailing bytes after {} cell",
                buf.remaining(),
                cell.name()
            )));
        }
        Ok(cell)
    }
}

/// Plaintext of an onion layer carrying `cell` for the hop that opens it.
pub fn cell_layer(cell: &Cell) -> Vec<u8> {
    let mut buf = vec![LAYER_CELL];
    buf.extend_from_slice(&cell.encode());
    buf
}

/// Plaintext of an onion layer wrapping an inner sealed layer.
pub fn relay_layer(inner: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(inner.len() + 1);
    buf.push(LAYER_RELAY);
    buf.extend_from_slice(inner);
    buf
}

fn need(buf: &&[u8], len: usize) -> Result<(), TunnelError> {
    if buf.len() < len {
        return Err(TunnelError::protocol("truncated cell"));
    }
    Ok(())
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

fn decode_block(buf: &mut &[u8]) -> Result<LedgerBlock, TunnelError> {
    LedgerBlock::decode(buf).map_err(|e| TunnelError::protocol(e.to_string()))
}

fn put_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn get_addr(buf: &mut &[u8]) -> Result<SocketAddr, TunnelError> {
    need(buf, 1)?;
    let ip = match buf.get_u8() {
        4 => {
            need(buf, 4 + 2)?;
            IpAddr::V4(Ipv4Addr::from(take_array::<4>(buf)))
        }
        6 => {
            need(buf, 16 + 2)?;
            IpAddr::V6(Ipv6Addr::from(take_array::<16>(buf)))
        }
        family => return Err(TunnelError::protocol(format!("unknown address family {family}"))),
    };
    Ok(SocketAddr::new(ip, buf.get_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::crypto::NodeIdentity;
    use crate::tunnel::ledger::Ledger;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_data_cell_layout() {
        let cell = Cell::Data {
            destination: addr(6881),
            origin: "[::1]:51413".parse().unwrap(),
            payload: Bytes::from_static(b"d1:ad2:id20:"),
        };
        let bytes = cell.encode();
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..6], &[4, 10, 0, 0, 1]);
        assert_eq!(Cell::decode(&bytes).unwrap(), cell);
    }

    #[test]
    fn test_payout_carries_block() {
        let mut ledger = Ledger::new(NodeIdentity::from_secret([5; 32]));
        let block = ledger.create_block([1; 32], 0, 0, 5 * 1024 * 1024);
        let cell = Cell::Payout {
            block: block.clone(),
            circuit_id: 77,
            base_amount: 1024 * 1024,
        };
        match Cell::decode(&cell.encode()).unwrap() {
            Cell::Payout {
                block: decoded,
                circuit_id,
                base_amount,
            } => {
                assert_eq!(decoded, block);
                assert_eq!((circuit_id, base_amount), (77, 1024 * 1024));
            }
            other => panic!("unexpected cell {other:?}"),
        }
    }

    #[test]
    fn test_malformed_cells_are_rejected() {
        assert!(Cell::decode(&[]).is_err());
        assert!(Cell::decode(&[99]).is_err());
        assert!(Cell::decode(&[2, 0, 0]).is_err());
        let mut destroy = Cell::Destroy { reason: 1 }.encode();
        destroy.push(0);
        assert!(Cell::decode(&destroy).is_err());
        assert!(Cell::decode(&[3, 5, 1, 2, 3, 4, 0, 80]).is_err());
    }

    #[test]
    fn test_datagram_header() {
        let datagram = Datagram::Plain {
            circuit_id: 0xdead_beef,
            cell: Cell::Created { dh_key: [7; 32] },
        };
        let bytes = datagram.encode();
        assert_eq!(&bytes[..7], &[b'U', b'T', 0xde, 0xad, 0xbe, 0xef, 0]);
        assert_eq!(Datagram::decode(&bytes).unwrap(), datagram);

        let handshake = Datagram::Handshake {
            circuit_id: 1,
            dh_key: [2; 32],
            body: Bytes::from_static(b"sealed"),
        };
        assert_eq!(Datagram::decode(&handshake.encode()).unwrap(), handshake);

        assert!(Datagram::decode(b"XX\0\0\0\x01\x00").is_err());
        assert!(Datagram::decode(&vec![0u8; MAX_CELL_SIZE + 1]).is_err());
    }
}
