//! Signed, hash-chained bandwidth ledger.
//!
//! Every node keeps one chain of blocks signed with its identity. A block
//! records one transfer with a counterparty plus running totals, so the
//! latest block alone yields the owner's balance.

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

use super::crypto::{NodeIdentity, verify_signature};

pub const BANDWIDTH_BLOCK_TYPE: &str = "tribler_bandwidth";
const ZERO_HASH: [u8; 32] = [0; 32];

/// Errors raised while validating ledger blocks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid signature on block {seq}")]
    InvalidSignature { seq: u32 },

    #[error("Block {seq} does not link to its predecessor")]
    BrokenChain { seq: u32 },

    #[error("Conflicting block at sequence {seq}")]
    DoubleSpend { seq: u32 },

    #[error("Block is not addressed to this node")]
    WrongCounterparty,

    #[error("Malformed block: {reason}")]
    Malformed { reason: String },
}

/// Byte accounting for one hop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transaction {
    pub up: u64,
    pub down: u64,
    pub total_up: u64,
    pub total_down: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBlock {
    pub public_key: [u8; 32],
    pub seq: u32,
    pub link_public_key: [u8; 32],
    pub link_seq: u32,
    pub previous_hash: [u8; 32],
    pub signature: [u8; 64],
    pub block_type: String,
    pub transaction: Transaction,
    pub timestamp: i64,
}

impl LedgerBlock {
    /// Upload minus download credit of the block's owner.
    pub fn balance(&self) -> i64 {
        let up = i64::try_from(self.transaction.total_up).unwrap_or(i64::MAX);
        let down = i64::try_from(self.transaction.total_down).unwrap_or(i64::MAX);
        up.saturating_sub(down)
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(200);
        buf.put_slice(&self.public_key);
        buf.put_u32(self.seq);
        buf.put_slice(&self.link_public_key);
        buf.put_u32(self.link_seq);
        buf.put_slice(&self.previous_hash);
        buf.put_u8(self.block_type.len().min(255) as u8);
        buf.put_slice(&self.block_type.as_bytes()[..self.block_type.len().min(255)]);
        buf.put_u64(self.transaction.up);
        buf.put_u64(self.transaction.down);
        buf.put_u64(self.transaction.total_up);
        buf.put_u64(self.transaction.total_down);
        buf.put_i64(self.timestamp);
        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.signed_bytes();
        buf.put_slice(&self.signature);
        buf
    }

    /// Parses one block from the front of `buf`, advancing it.
    ///
    /// # Errors
    /// - `LedgerError::Malformed` - truncated block or non-UTF-8 type
    pub fn decode(buf: &mut &[u8]) -> Result<Self, LedgerError> {
        let truncated = || LedgerError::Malformed {
            reason: "truncated block".to_string(),
        };
        if buf.remaining() < 32 + 4 + 32 + 4 + 32 + 1 {
            return Err(truncated());
        }
        let public_key = take_array::<32>(buf);
        let seq = buf.get_u32();
        let link_public_key = take_array::<32>(buf);
        let link_seq = buf.get_u32();
        let previous_hash = take_array::<32>(buf);
        let type_len = usize::from(buf.get_u8());
        if buf.remaining() < type_len + 5 * 8 + 64 {
            return Err(truncated());
        }
        let block_type = String::from_utf8(buf[..type_len].to_vec()).map_err(|_| LedgerError::Malformed {
            reason: "block type is not UTF-8".to_string(),
        })?;
        buf.advance(type_len);
        let transaction = Transaction {
            up: buf.get_u64(),
            down: buf.get_u64(),
            total_up: buf.get_u64(),
            total_down: buf.get_u64(),
        };
        let timestamp = buf.get_i64();
        let signature = take_array::<64>(buf);
        Ok(Self {
            public_key,
            seq,
            link_public_key,
            link_seq,
            previous_hash,
            signature,
            block_type,
            transaction,
            timestamp,
        })
    }

    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.encode()).into()
    }

    pub fn verify_signature(&self) -> bool {
        verify_signature(&self.public_key, &self.signed_bytes(), &self.signature)
    }
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

/// Local view of every chain this node has seen.
#[derive(Debug)]
pub struct Ledger {
    identity: NodeIdentity,
    chains: HashMap<[u8; 32], BTreeMap<u32, LedgerBlock>>,
}

impl Ledger {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            chains: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key()
    }

    pub fn latest(&self, public_key: &[u8; 32]) -> Option<&LedgerBlock> {
        self.chains
            .get(public_key)
            .and_then(|chain| chain.last_key_value())
            .map(|(_, block)| block)
    }

    pub fn block(&self, public_key: &[u8; 32], seq: u32) -> Option<&LedgerBlock> {
        self.chains.get(public_key)?.get(&seq)
    }

    pub fn balance(&self, public_key: &[u8; 32]) -> i64 {
        self.latest(public_key).map(LedgerBlock::balance).unwrap_or(0)
    }

    pub fn own_balance(&self) -> i64 {
        self.balance(&self.public_key())
    }

    /// Appends a signed block recording a transfer with `link_public_key`.
    pub fn create_block(
        &mut self,
        link_public_key: [u8; 32],
        link_seq: u32,
        up: u64,
        down: u64,
    ) -> LedgerBlock {
        let own = self.public_key();
        let (seq, previous_hash, total_up, total_down) = match self.latest(&own) {
            Some(last) => (
                last.seq + 1,
                last.hash(),
                last.transaction.total_up,
                last.transaction.total_down,
            ),
            None => (1, ZERO_HASH, 0, 0),
        };
        let block = self.sign(LedgerBlock {
            public_key: own,
            seq,
            link_public_key,
            link_seq,
            previous_hash,
            signature: [0; 64],
            block_type: BANDWIDTH_BLOCK_TYPE.to_string(),
            transaction: Transaction {
                up,
                down,
                total_up: total_up.saturating_add(up),
                total_down: total_down.saturating_add(down),
            },
            timestamp: chrono::Utc::now().timestamp(),
        });
        self.chains.entry(own).or_default().insert(seq, block.clone());
        block
    }

    /// Latest own block, or a signed zero statement when the chain is empty.
    pub fn balance_statement(&self) -> LedgerBlock {
        if let Some(block) = self.latest(&self.public_key()) {
            return block.clone();
        }
        self.sign(LedgerBlock {
            public_key: self.public_key(),
            seq: 0,
            link_public_key: [0; 32],
            link_seq: 0,
            previous_hash: ZERO_HASH,
            signature: [0; 64],
            block_type: BANDWIDTH_BLOCK_TYPE.to_string(),
            transaction: Transaction::default(),
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    fn sign(&self, mut block: LedgerBlock) -> LedgerBlock {
        block.signature = self.identity.sign(&block.signed_bytes());
        block
    }

    /// Checks a foreign block against its signature and our copy of its chain.
    ///
    /// # Errors
    /// - `LedgerError::InvalidSignature` - signature does not match `public_key`
    /// - `LedgerError::DoubleSpend` - a different block with this sequence is known
    /// - `LedgerError::BrokenChain` - `previous_hash` or totals do not follow the predecessor
    pub fn validate(&self, block: &LedgerBlock) -> Result<(), LedgerError> {
        if !block.verify_signature() {
            return Err(LedgerError::InvalidSignature { seq: block.seq });
        }
        let tx = &block.transaction;
        if block.seq == 0 {
            return if block.previous_hash == ZERO_HASH && tx.total_up == 0 && tx.total_down == 0 {
                Ok(())
            } else {
                Err(LedgerError::BrokenChain { seq: 0 })
            };
        }
        if let Some(known) = self.block(&block.public_key, block.seq) {
            return if known == block {
                Ok(())
            } else {
                Err(LedgerError::DoubleSpend { seq: block.seq })
            };
        }
        if block.seq == 1 {
            if block.previous_hash != ZERO_HASH || tx.total_up != tx.up || tx.total_down != tx.down {
                return Err(LedgerError::BrokenChain { seq: 1 });
            }
        } else if let Some(previous) = self.block(&block.public_key, block.seq - 1) {
            let prev = &previous.transaction;
            if block.previous_hash != previous.hash()
                || prev.total_up.checked_add(tx.up) != Some(tx.total_up)
                || prev.total_down.checked_add(tx.down) != Some(tx.total_down)
            {
                return Err(LedgerError::BrokenChain { seq: block.seq });
            }
        }
        Ok(())
    }

    /// Validates and stores a foreign block. Zero statements are not stored.
    ///
    /// # Errors
    /// Same as [`Ledger::validate`].
    pub fn add_block(&mut self, block: LedgerBlock) -> Result<(), LedgerError> {
        self.validate(&block)?;
        if block.seq > 0 {
            self.chains
                .entry(block.public_key)
                .or_default()
                .insert(block.seq, block);
        }
        Ok(())
    }
}
