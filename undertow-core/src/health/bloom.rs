//! BEP-33 bloom filters carried in DHT scrape replies.

use std::fmt;
use std::net::IpAddr;

use sha1::{Digest, Sha1};

use crate::constants::{BLOOM_FILTER_BITS, BLOOM_FILTER_BYTES, BLOOM_FILTER_HASHES};

/// 2048-bit filter of peer IP addresses with two hash functions.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: [u8; BLOOM_FILTER_BYTES],
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("set_bits", &self.set_bits())
            .finish()
    }
}

impl BloomFilter {
    pub fn new() -> Self {
        Self {
            bits: [0; BLOOM_FILTER_BYTES],
        }
    }

    /// Filter from the 256 raw bytes of a `BFsd`/`BFpe` value.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bits: [u8; BLOOM_FILTER_BYTES] = bytes.try_into().ok()?;
        Some(Self { bits })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn insert_ip(&mut self, ip: IpAddr) {
        for index in bit_indices(ip) {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// May report false positives, never false negatives.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        bit_indices(ip)
            .iter()
            .all(|index| self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Merges another responder's filter into this one.
    pub fn union(&mut self, other: &BloomFilter) {
        for (mine, theirs) in self.bits.iter_mut().zip(other.bits.iter()) {
            *mine |= theirs;
        }
    }

    pub fn set_bits(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn estimate(&self) -> u64 {
        estimate_count(self)
    }
}

/// Estimated number of distinct addresses inserted into `filter`.
///
/// `n = ln(c / m) / (k * ln(1 - 1/m))` with `c` unset bits out of `m`.
/// A saturated filter is clamped to one unset bit.
pub fn estimate_count(filter: &BloomFilter) -> u64 {
    let m = BLOOM_FILTER_BITS as f64;
    let zero_bits = (BLOOM_FILTER_BITS as u32 - filter.set_bits()).max(1) as f64;
    let k = f64::from(BLOOM_FILTER_HASHES);
    let estimate = (zero_bits / m).ln() / (k * (1.0 - 1.0 / m).ln());
    estimate.round().max(0.0) as u64
}

fn bit_indices(ip: IpAddr) -> [usize; 2] {
    let digest = match ip {
        IpAddr::V4(v4) => Sha1::digest(v4.octets()),
        IpAddr::V6(v6) => Sha1::digest(v6.octets()),
    };
    let first = usize::from(digest[0]) | usize::from(digest[1]) << 8;
    let second = usize::from(digest[2]) | usize::from(digest[3]) << 8;
    [first % BLOOM_FILTER_BITS, second % BLOOM_FILTER_BITS]
}
