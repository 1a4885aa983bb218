//! Torrent metainfo: parsing, validation, creation and Merkle trees

pub mod bencode;
pub mod creation;
pub mod magnet;
pub mod merkle;
pub mod torrent_def;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use creation::{CreatedTorrent, CreationProgress, NoProgress, TorrentCreator, piece_length_for};
pub use magnet::parse_magnet;
pub use merkle::{MerkleTree, merkle_root, verify_sibling_path};
pub use torrent_def::{DownloadDef, FileEntry, TorrentDef, TorrentDefNoMetainfo};

use crate::ErrorKind;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte digest of the bencoded info dictionary. For Merkle torrents the
/// info dictionary carries the root hash, so the infohash commits to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Builds an InfoHash from a byte slice of exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    /// Parses a 40-character hex string.
    ///
    /// # Errors
    /// - `TorrentError::InvalidInfoHash` - wrong length or non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, TorrentError> {
        let bytes = hex::decode(hex_str).map_err(|_| TorrentError::InvalidInfoHash {
            value: hex_str.to_string(),
        })?;
        Self::from_slice(&bytes).ok_or_else(|| TorrentError::InvalidInfoHash {
            value: hex_str.to_string(),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur while handling torrent metainfo.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid path component {component:?}")]
    InvalidPath { component: String },

    #[error("Duplicate file path {path}")]
    DuplicatePath { path: String },

    #[error("Invalid infohash {value:?}")]
    InvalidInfoHash { value: String },

    #[error("Invalid magnet link: {reason}")]
    InvalidMagnetLink { reason: String },

    #[error("Invalid Merkle sibling path: {reason}")]
    InvalidSiblingPath { reason: String },

    #[error("Torrent creation cancelled")]
    Cancelled,

    #[error("Bencode error: {reason}")]
    Bencode { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::InvalidSiblingPath { .. } => ErrorKind::Integrity,
            TorrentError::Io(_) => ErrorKind::TransientIo,
            _ => ErrorKind::Validation,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        TorrentError::InvalidTorrentFile {
            reason: reason.into(),
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(e: serde_bencode::Error) -> Self {
        TorrentError::Bencode {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_info_hash_hex_parsing() {
        let parsed = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(parsed.as_bytes()[0], 0x01);
        assert!(InfoHash::from_hex("0123").is_err());
        assert!(InfoHash::from_hex("zz23456789abcdef0123456789abcdef01234567").is_err());
    }

    #[test]
    fn test_info_hash_serializes_as_hex() {
        let ih = InfoHash::new([0xff; 20]);
        let json = serde_json::to_string(&ih).unwrap();
        assert_eq!(json, format!("\"{}\"", "ff".repeat(20)));
        let back: InfoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ih);
    }
}
