//! RSS/Atom feeds publishing `.torrent` links.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::MiningError;
use crate::constants::RSS_UNAVAILABLE_BACKOFF;
use crate::torrent::{TorrentDef, bencode};

const TORRENT_MIME: &str = "application/x-bittorrent";

fn pattern(re: &str) -> Regex {
    Regex::new(re).unwrap_or_else(|_| unreachable!("static pattern"))
}

static ENTRY: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?s)<entry\b[^>]*>(.*?)</entry>"));
static TITLE: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?s)<title\b[^>]*>(.*?)</title>"));
static LINK: LazyLock<Regex> = LazyLock::new(|| pattern(r"<link\b([^>]*)/?>"));
static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r#"([\w:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#));
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|amp|lt|gt|quot|apos);"));

/// One feed entry that links to a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: Option<String>,
    pub link: String,
}

/// Resolves character references.
///
/// Code points of 256 and above are replaced by `?`.
pub fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures| {
            let entity = &caps[1];
            let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok()
            } else {
                return match entity {
                    "amp" => "&",
                    "lt" => "<",
                    "gt" => ">",
                    "quot" => "\"",
                    _ => "'",
                }
                .to_string();
            };
            match code.filter(|c| *c < 256).and_then(char::from_u32) {
                Some(c) => c.to_string(),
                None => "?".to_string(),
            }
        })
        .into_owned()
}

/// Extracts entries carrying an `application/x-bittorrent` link.
pub fn parse_feed(xml: &str) -> Vec<FeedEntry> {
    ENTRY
        .captures_iter(xml)
        .filter_map(|entry| {
            let body = entry.get(1)?.as_str();
            let link = LINK.captures_iter(body).find_map(|link| {
                let mut href = None;
                let mut is_torrent = false;
                for attr in ATTRIBUTE.captures_iter(&link[1]) {
                    let value = attr.get(2).or_else(|| attr.get(3)).map_or("", |m| m.as_str());
                    match &attr[1] {
                        "href" => href = Some(decode_entities(value)),
                        "type" => is_torrent = value.eq_ignore_ascii_case(TORRENT_MIME),
                        _ => {}
                    }
                }
                href.filter(|_| is_torrent)
            })?;
            let title = TITLE
                .captures(body)
                .map(|t| decode_entities(t[1].trim()));
            Some(FeedEntry { title, link })
        })
        .collect()
}

/// Downloads a feed document.
///
/// # Errors
/// - `MiningError::Unavailable` - the server answered 503
/// - `MiningError::Fetch` - any other transport or HTTP failure
pub async fn fetch_feed(http: &reqwest::Client, url: &str) -> Result<String, MiningError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| MiningError::fetch(url, e.to_string()))?;
    if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        return Err(MiningError::Unavailable {
            url: url.to_string(),
        });
    }
    let response = response
        .error_for_status()
        .map_err(|e| MiningError::fetch(url, e.to_string()))?;
    response
        .text()
        .await
        .map_err(|e| MiningError::fetch(url, e.to_string()))
}

/// Fetches and parses the torrent behind `link`, keeping a copy in `store_dir`.
async fn fetch_torrent(
    http: &reqwest::Client,
    link: &str,
    store_dir: &Path,
) -> Result<TorrentDef, MiningError> {
    let body = http
        .get(link)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| MiningError::fetch(link, e.to_string()))?
        .bytes()
        .await
        .map_err(|e| MiningError::fetch(link, e.to_string()))?;

    let def = TorrentDef::load_from_dict(bencode::decode(&body)?)?;
    tokio::fs::create_dir_all(store_dir).await?;
    let path = store_dir.join(format!("{}.torrent", def.infohash().to_hex()));
    tokio::fs::write(&path, &body).await?;
    Ok(def)
}

/// Polls `url` once and returns torrents from links not seen before.
///
/// A 503 is retried once after a short back-off. Broken torrent links are
/// logged and skipped.
///
/// # Errors
/// - `MiningError::Unavailable` - still unavailable after the back-off
/// - `MiningError::Fetch` - the feed itself could not be fetched
pub(crate) async fn update_feed(
    http: &reqwest::Client,
    url: &str,
    seen: &mut HashSet<String>,
    store_dir: &Path,
    budget: usize,
) -> Result<Vec<TorrentDef>, MiningError> {
    let xml = match fetch_feed(http, url).await {
        Err(MiningError::Unavailable { .. }) => {
            tracing::info!("Feed {} unavailable, retrying in {:?}", url, RSS_UNAVAILABLE_BACKOFF);
            tokio::time::sleep(RSS_UNAVAILABLE_BACKOFF).await;
            fetch_feed(http, url).await?
        }
        other => other?,
    };

    let mut defs = Vec::new();
    for entry in parse_feed(&xml) {
        if defs.len() >= budget {
            break;
        }
        if !seen.insert(entry.link.clone()) {
            continue;
        }
        match fetch_torrent(http, &entry.link, store_dir).await {
            Ok(def) => {
                tracing::debug!(
                    "Feed {} offered {}",
                    url,
                    entry.title.as_deref().unwrap_or(def.name())
                );
                defs.push(def);
            }
            Err(e) => tracing::warn!("Skipping feed link {}: {}", entry.link, e),
        }
    }
    Ok(defs)
}
