//! Magnet link parsing (`magnet:?xt=urn:btih:...`).

use url::Url;

use super::{InfoHash, TorrentDefNoMetainfo, TorrentError};

const BTIH_PREFIX: &str = "urn:btih:";
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Parses a magnet link into a metainfo-less definition.
///
/// The infohash may be 40 hex or 32 base32 characters. Without `dn` the
/// hex infohash doubles as the name.
///
/// # Errors
/// - `TorrentError::InvalidMagnetLink` - not a magnet URI or no usable `xt`
pub fn parse_magnet(link: &str) -> Result<TorrentDefNoMetainfo, TorrentError> {
    let url = Url::parse(link).map_err(|e| TorrentError::InvalidMagnetLink {
        reason: e.to_string(),
    })?;
    if url.scheme() != "magnet" {
        return Err(TorrentError::InvalidMagnetLink {
            reason: format!("unexpected scheme {}", url.scheme()),
        });
    }

    let mut infohash = None;
    let mut name = None;
    let mut trackers: Vec<String> = Vec::new();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" if infohash.is_none() => {
                if let Some(encoded) = value.strip_prefix(BTIH_PREFIX) {
                    infohash = Some(decode_btih(encoded)?);
                }
            }
            "dn" => name = Some(value.into_owned()),
            "tr" => {
                let tracker = value.into_owned();
                if !trackers.contains(&tracker) {
                    trackers.push(tracker);
                }
            }
            _ => {}
        }
    }

    let infohash = infohash.ok_or_else(|| TorrentError::InvalidMagnetLink {
        reason: "missing urn:btih exact topic".to_string(),
    })?;

    Ok(TorrentDefNoMetainfo {
        infohash,
        name: name.unwrap_or_else(|| infohash.to_hex()),
        url: Some(link.to_string()),
        trackers,
    })
}

fn decode_btih(encoded: &str) -> Result<InfoHash, TorrentError> {
    let invalid = || TorrentError::InvalidMagnetLink {
        reason: format!("bad btih value {encoded:?}"),
    };
    match encoded.len() {
        40 => InfoHash::from_hex(encoded).map_err(|_| invalid()),
        32 => base32_decode(encoded)
            .and_then(|bytes| InfoHash::from_slice(&bytes))
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer = 0u64;
    let mut bits = 0u32;
    for c in input.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == c.to_ascii_uppercase())? as u64;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_parse_hex_magnet() {
        let link = format!(
            "magnet:?xt=urn:btih:{HEX}&dn=Ubuntu%20ISO&tr=udp%3A%2F%2Ftracker.example.com%3A80&tr=http%3A%2F%2Ftwo%2Fannounce"
        );
        let def = parse_magnet(&link).unwrap();
        assert_eq!(def.infohash.to_hex(), HEX);
        assert_eq!(def.name, "Ubuntu ISO");
        assert_eq!(
            def.trackers,
            vec![
                "udp://tracker.example.com:80".to_string(),
                "http://two/announce".to_string()
            ]
        );
        assert_eq!(def.url.as_deref(), Some(link.as_str()));
    }

    #[test]
    fn test_parse_base32_magnet() {
        let bytes = hex::decode(HEX).unwrap();
        let mut encoded = String::new();
        let mut buffer = 0u64;
        let mut bits = 0;
        for b in bytes {
            buffer = (buffer << 8) | u64::from(b);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                encoded.push(BASE32_ALPHABET[((buffer >> bits) & 31) as usize] as char);
            }
        }
        assert_eq!(encoded.len(), 32);

        let def = parse_magnet(&format!("magnet:?xt=urn:btih:{encoded}")).unwrap();
        assert_eq!(def.infohash.to_hex(), HEX);
        assert_eq!(def.name, HEX);
    }

    #[test]
    fn test_rejects_invalid_links() {
        assert!(parse_magnet("http://example.com/file.torrent").is_err());
        assert!(parse_magnet("magnet:?dn=nothing").is_err());
        assert!(parse_magnet("magnet:?xt=urn:btih:1234").is_err());
    }
}
