//! Thin helpers over `serde_bencode::value::Value`.
//!
//! Dictionaries are encoded with sorted keys, so `encode(decode(x)) == x`
//! holds for any canonically encoded input.

use std::collections::HashMap;

pub use serde_bencode::value::Value;

use super::TorrentError;

/// Decodes a complete bencoded value.
///
/// # Errors
/// - `TorrentError::Bencode` - input is not valid bencode
pub fn decode(bytes: &[u8]) -> Result<Value, TorrentError> {
    if bytes.is_empty() {
        return Err(TorrentError::Bencode {
            reason: "empty input".to_string(),
        });
    }
    Ok(serde_bencode::from_bytes::<Value>(bytes)?)
}

/// Encodes a value canonically.
///
/// # Errors
/// - `TorrentError::Bencode` - value cannot be serialized
pub fn encode(value: &Value) -> Result<Vec<u8>, TorrentError> {
    Ok(serde_bencode::to_bytes(value)?)
}

pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(data.into())
}

pub fn string(data: &str) -> Value {
    Value::Bytes(data.as_bytes().to_vec())
}

pub fn int(value: i64) -> Value {
    Value::Int(value)
}

/// Builds a dictionary from `(key, value)` pairs.
pub fn dict<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect(),
    )
}

pub fn as_dict(value: &Value) -> Option<&HashMap<Vec<u8>, Value>> {
    match value {
        Value::Dict(d) => Some(d),
        _ => None,
    }
}

pub fn as_dict_mut(value: &mut Value) -> Option<&mut HashMap<Vec<u8>, Value>> {
    match value {
        Value::Dict(d) => Some(d),
        _ => None,
    }
}

pub fn get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    as_dict(value).and_then(|d| d.get(key.as_bytes()))
}

pub fn get_int(value: &Value, key: &str) -> Option<i64> {
    match get(value, key) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    }
}

pub fn get_bytes<'a>(value: &'a Value, key: &str) -> Option<&'a [u8]> {
    match get(value, key) {
        Some(Value::Bytes(b)) => Some(b.as_slice()),
        _ => None,
    }
}

pub fn get_str(value: &Value, key: &str) -> Option<String> {
    get_bytes(value, key).map(|b| String::from_utf8_lossy(b).into_owned())
}

pub fn get_list<'a>(value: &'a Value, key: &str) -> Option<&'a [Value]> {
    match get(value, key) {
        Some(Value::List(l)) => Some(l.as_slice()),
        _ => None,
    }
}

/// Inserts or replaces `key` in a dictionary value; no-op for non-dicts.
pub fn insert(value: &mut Value, key: &str, item: Value) {
    if let Some(d) = as_dict_mut(value) {
        d.insert(key.as_bytes().to_vec(), item);
    }
}

pub fn remove(value: &mut Value, key: &str) -> Option<Value> {
    as_dict_mut(value).and_then(|d| d.remove(key.as_bytes()))
}

/// Converts a list of byte strings into UTF-8 strings, skipping other items.
pub fn string_list(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|v| match v {
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_sorts_dictionary_keys() {
        let value = dict([("zeta", int(1)), ("alpha", string("x"))]);
        let encoded = encode(&value).unwrap();
        assert_eq!(encoded, b"d5:alpha1:x4:zetai1ee");
    }

    #[test]
    fn test_decode_and_lookup() {
        let value = decode(b"d5:filesd3:abcd8:completei7eee4:name4:teste").unwrap();
        assert_eq!(get_str(&value, "name").as_deref(), Some("test"));
        let files = get(&value, "files").unwrap();
        let entry = as_dict(files).unwrap().get(b"abc".as_slice()).unwrap();
        assert_eq!(get_int(entry, "complete"), Some(7));
        assert_eq!(get_int(entry, "incomplete"), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"").is_err());
        assert!(decode(b"d3:key").is_err());
    }
}
