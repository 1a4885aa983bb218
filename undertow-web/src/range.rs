//! HTTP Range handling for file streaming
//!
//! Only single `bytes=` ranges are honoured. Anything else is ignored and
//! the whole file is served, which RFC 7233 permits.

use axum::http::HeaderMap;
use axum::http::header::RANGE;

/// A byte range requested by the client, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end` or `bytes=start-`.
    From { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last `n` bytes.
    Suffix { len: u64 },
}

/// Outcome of matching a requested range against a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeResolution {
    /// No usable range; send the whole file with 200.
    Full,
    /// Send `start..=end` with 206.
    Partial { start: u64, end: u64 },
    /// Start lies past the end of the file; answer 416.
    NotSatisfiable,
}

/// Parses a `Range` header value.
///
/// Returns `None` for other units, multiple ranges or malformed numbers.
///
/// # Examples
/// ```
/// use undertow_web::range::{ByteRange, parse_range};
/// assert_eq!(
///     parse_range("bytes=100-199"),
///     Some(ByteRange::From { start: 100, end: Some(199) })
/// );
/// ```
pub fn parse_range(value: &str) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let len = end.parse::<u64>().ok()?;
        return Some(ByteRange::Suffix { len });
    }
    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        let end = end.parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        Some(end)
    };
    Some(ByteRange::From { start, end })
}

/// Reads the `Range` header, if any.
pub fn range_from_headers(headers: &HeaderMap) -> Option<ByteRange> {
    headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range)
}

/// Clamps `range` to a file of `file_size` bytes.
pub fn resolve(range: Option<ByteRange>, file_size: u64) -> RangeResolution {
    let last = file_size.saturating_sub(1);
    match range {
        None => RangeResolution::Full,
        Some(ByteRange::From { start, .. }) if start >= file_size => {
            RangeResolution::NotSatisfiable
        }
        Some(ByteRange::From { start, end }) => RangeResolution::Partial {
            start,
            end: end.map_or(last, |end| end.min(last)),
        },
        Some(ByteRange::Suffix { len }) if len == 0 || file_size == 0 => {
            RangeResolution::NotSatisfiable
        }
        Some(ByteRange::Suffix { len }) => RangeResolution::Partial {
            start: file_size.saturating_sub(len),
            end: last,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range("bytes=500-"),
            Some(ByteRange::From {
                start: 500,
                end: None
            })
        );
        assert_eq!(parse_range("bytes=-200"), Some(ByteRange::Suffix { len: 200 }));
        assert_eq!(parse_range("items=0-1"), None);
        assert_eq!(parse_range("bytes=0-1,5-9"), None);
        assert_eq!(parse_range("bytes=9-3"), None);
        assert_eq!(parse_range("bytes=abc-"), None);
    }

    #[test]
    fn test_resolve_clamps_to_file() {
        let range = parse_range("bytes=100-9999");
        assert_eq!(
            resolve(range, 1000),
            RangeResolution::Partial {
                start: 100,
                end: 999
            }
        );
        assert_eq!(
            resolve(parse_range("bytes=-300"), 1000),
            RangeResolution::Partial {
                start: 700,
                end: 999
            }
        );
        assert_eq!(
            resolve(parse_range("bytes=-5000"), 1000),
            RangeResolution::Partial { start: 0, end: 999 }
        );
        assert_eq!(resolve(None, 1000), RangeResolution::Full);
    }

    #[test]
    fn test_start_past_end_not_satisfiable() {
        assert_eq!(
            resolve(parse_range("bytes=1000-"), 1000),
            RangeResolution::NotSatisfiable
        );
        assert_eq!(
            resolve(parse_range("bytes=0-"), 0),
            RangeResolution::NotSatisfiable
        );
    }
}
