//! Download management endpoints

use std::path::PathBuf;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use undertow_core::InfoHash;
use undertow_core::config::DownloadDefaults;
use undertow_core::engine::{DownloadConfig, DownloadSource, DownloadState, PeerInfo};

use super::parse_infohash;
use crate::error::ApiError;
use crate::server::AppState;

const TORRENT_MIME: &str = "application/x-bittorrent";

/// Query parameters of `GET /downloads`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DownloadsQuery {
    #[serde(deserialize_with = "flag")]
    pub get_peers: bool,
    #[serde(deserialize_with = "flag")]
    pub get_pieces: bool,
    #[serde(deserialize_with = "flag")]
    pub get_availability: bool,
    /// Restricts the detail fields to one download.
    pub infohash: Option<String>,
}

/// Accepts `1`/`0` as well as `true`/`false`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok(matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    ))
}

/// Options for `PUT /downloads`.
///
/// Sent as the JSON body, or as query parameters when the body is a
/// `.torrent` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AddDownloadRequest {
    pub uri: Option<String>,
    pub anon_hops: Option<u8>,
    pub safe_seeding: Option<bool>,
    pub destination: Option<PathBuf>,
    pub completed_dir: Option<PathBuf>,
    pub selected_files: Option<Vec<usize>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RemoveDownloadRequest {
    pub remove_data: bool,
}

/// Body of `PATCH /downloads/{infohash}`; exactly one change per request.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateDownloadRequest {
    pub anon_hops: Option<u8>,
    pub selected_files: Option<Vec<usize>>,
    pub state: Option<String>,
    /// Target of `state: "move_storage"`.
    pub dest_dir: Option<PathBuf>,
    /// An empty path clears the completed directory.
    pub completed_dir: Option<PathBuf>,
}

/// `GET /downloads`
pub async fn get_downloads(
    State(state): State<AppState>,
    Query(query): Query<DownloadsQuery>,
) -> Result<Json<Value>, ApiError> {
    let only = query.infohash.as_deref().map(parse_infohash).transpose()?;
    let downloads = state.engine.get_downloads(false).await?;
    let checkpoints = state.engine.checkpoint_progress().await?;

    let mut entries = Vec::with_capacity(downloads.len());
    for download in &downloads {
        let detailed = only.is_none_or(|ih| ih == download.infohash);
        let mut entry = serde_json::to_value(download)
            .map_err(|e| ApiError::internal(e.to_string()))?;

        if detailed && (query.get_peers || query.get_availability) {
            let peers = state.engine.get_peers(download.infohash).await?;
            if query.get_availability {
                entry["availability"] = json!(availability(&peers));
            }
            if query.get_peers {
                entry["peers"] = json!(peers);
            }
        }
        if detailed && query.get_pieces {
            entry["pieces"] = json!(encode_pieces(&download.pieces));
        }
        entries.push(entry);
    }

    Ok(Json(json!({
        "downloads": entries,
        "checkpoints": checkpoints,
    })))
}

/// Estimated number of distributed copies among connected peers.
///
/// Complete peers count as one copy each; the best partial peer adds its
/// fraction.
pub fn availability(peers: &[PeerInfo]) -> f64 {
    let seeders = peers.iter().filter(|p| p.progress >= 1.0).count() as f64;
    let partial = peers
        .iter()
        .map(|p| p.progress)
        .filter(|p| *p < 1.0)
        .fold(0.0, f64::max);
    seeders + partial
}

/// Packs the piece bitfield MSB first and hex-encodes it.
pub fn encode_pieces(pieces: &[bool]) -> String {
    let bytes: Vec<u8> = pieces
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .filter(|(_, have)| **have)
                .fold(0u8, |byte, (i, _)| byte | (0x80 >> i))
        })
        .collect();
    hex::encode(bytes)
}

fn download_config(
    defaults: &DownloadDefaults,
    request: &AddDownloadRequest,
) -> Result<DownloadConfig, ApiError> {
    let mut config = DownloadConfig::from_defaults(defaults);
    if let Some(hops) = request.anon_hops {
        config.hops = hops;
    }
    if let Some(safe_seeding) = request.safe_seeding {
        config.safe_seeding = safe_seeding;
    }
    if config.hops > 0 && !config.safe_seeding {
        return Err(ApiError::bad_request(
            "Cannot set anonymous download without safe seeding enabled",
        ));
    }
    if let Some(destination) = &request.destination {
        config.dest_dir = destination.clone();
    }
    config.completed_dir = request.completed_dir.clone();
    if let Some(selected) = &request.selected_files {
        config.selected_files = selected.iter().copied().collect();
    }
    Ok(config)
}

/// `PUT /downloads`
pub async fn add_download(
    State(state): State<AppState>,
    Query(options): Query<AddDownloadRequest>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let is_torrent = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(TORRENT_MIME));

    let (source, request) = if is_torrent {
        (DownloadSource::Bytes(body.to_vec()), options)
    } else {
        let request: AddDownloadRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?;
        let uri = request
            .uri
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ApiError::bad_request("uri parameter missing"))?;
        (DownloadSource::Uri(uri), request)
    };

    let config = download_config(&state.defaults, &request)?;
    let download = state.engine.start(source, config).await?;
    tracing::info!("Started download {} via API", download.infohash);
    Ok(Json(json!({
        "started": true,
        "infohash": download.infohash,
    })))
}

/// `DELETE /downloads/{infohash}`
pub async fn remove_download(
    State(state): State<AppState>,
    Path(infohash): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let infohash = parse_infohash(&infohash)?;
    let request: RemoveDownloadRequest = if body.is_empty() {
        RemoveDownloadRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?
    };

    state
        .engine
        .remove(infohash, request.remove_data, true)
        .await?;
    Ok(Json(json!({
        "removed": true,
        "infohash": infohash,
    })))
}

/// `PATCH /downloads/{infohash}`
pub async fn update_download(
    State(state): State<AppState>,
    Path(infohash): Path<String>,
    Json(request): Json<UpdateDownloadRequest>,
) -> Result<Json<Value>, ApiError> {
    let infohash = parse_infohash(&infohash)?;
    let changes = [
        request.anon_hops.is_some(),
        request.selected_files.is_some(),
        request.state.is_some(),
        request.completed_dir.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if changes != 1 {
        return Err(ApiError::bad_request(
            "exactly one of anon_hops, selected_files, state or completed_dir is required",
        ));
    }

    let updated = apply_update(&state, infohash, request).await?;
    Ok(Json(json!({
        "modified": true,
        "infohash": infohash,
        "download": updated,
    })))
}

async fn apply_update(
    state: &AppState,
    infohash: InfoHash,
    request: UpdateDownloadRequest,
) -> Result<DownloadState, ApiError> {
    let engine = &state.engine;
    if let Some(hops) = request.anon_hops {
        return Ok(engine.update_hops(infohash, hops).await?);
    }
    if let Some(selected) = request.selected_files {
        engine.set_selected_files(infohash, selected).await?;
    } else if let Some(completed_dir) = request.completed_dir {
        let completed_dir = (!completed_dir.as_os_str().is_empty()).then_some(completed_dir);
        engine.set_completed_dir(infohash, completed_dir).await?;
    } else if let Some(action) = request.state {
        match action.as_str() {
            "resume" => engine.resume(infohash).await?,
            "stop" => engine.pause(infohash).await?,
            "recheck" => engine.force_recheck(infohash).await?,
            "move_storage" => {
                let dest_dir = request
                    .dest_dir
                    .ok_or_else(|| ApiError::bad_request("move_storage requires dest_dir"))?;
                engine.move_storage(infohash, dest_dir).await?;
            }
            other => return Err(ApiError::bad_request(format!("unknown state: {other}"))),
        }
    }
    Ok(engine.get_download(infohash).await?)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn peer(progress: f64) -> PeerInfo {
        PeerInfo {
            addr: SocketAddr::from(([10, 0, 0, 1], 6881)),
            client: "test".to_string(),
            progress,
            remote_interested: false,
            upload_rate: 0,
            download_rate: 0,
        }
    }

    #[test]
    fn test_availability() {
        assert_eq!(availability(&[]), 0.0);
        assert_eq!(availability(&[peer(1.0), peer(1.0), peer(0.25), peer(0.5)]), 2.5);
    }

    #[test]
    fn test_encode_pieces_msb_first() {
        assert_eq!(encode_pieces(&[true, false, false, false, false, false, false, true, true]), "8180");
        assert_eq!(encode_pieces(&[]), "");
    }

    #[test]
    fn test_anonymous_download_requires_safe_seeding() {
        let defaults = DownloadDefaults::default();
        let request = AddDownloadRequest {
            anon_hops: Some(2),
            safe_seeding: Some(false),
            ..Default::default()
        };
        assert!(matches!(
            download_config(&defaults, &request),
            Err(ApiError::BadRequest { .. })
        ));

        let request = AddDownloadRequest {
            anon_hops: Some(0),
            safe_seeding: Some(false),
            destination: Some(PathBuf::from("/data")),
            selected_files: Some(vec![2, 0]),
            ..Default::default()
        };
        let config = download_config(&defaults, &request).unwrap();
        assert_eq!(config.hops, 0);
        assert_eq!(config.dest_dir, PathBuf::from("/data"));
        assert_eq!(config.selected_files.into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }
}
