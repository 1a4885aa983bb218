//! REST API tests driven through the router without a socket.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use undertow_core::config::UndertowConfig;
use undertow_core::engine::{
    DownloadManagerHandle, FixedDiskSpace, ManagerDeps, SimulatedSessionFactory, SimulatedSwarm,
    spawn_download_manager,
};
use undertow_core::torrent::{TorrentDef, bencode};
use undertow_web::{AppState, router};

const FILE_SIZE: usize = 3000;

struct Fixture {
    _state: TempDir,
    downloads: TempDir,
    engine: DownloadManagerHandle,
    app: Router,
}

impl Fixture {
    fn new() -> Self {
        let state = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let mut config = UndertowConfig::for_testing(state.path());
        config.libtorrent.download_defaults.saveas = downloads.path().to_path_buf();
        let defaults = config.libtorrent.download_defaults.clone();

        let deps = ManagerDeps::new(Arc::new(SimulatedSessionFactory::new(SimulatedSwarm::new())))
            .with_disk(Arc::new(FixedDiskSpace(None)));
        let engine = spawn_download_manager(config, deps);
        let app = router(AppState::new(engine.clone(), defaults));
        Self {
            _state: state,
            downloads,
            engine,
            app,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn add_torrent(&self, def: &TorrentDef) -> Response {
        let request = Request::builder()
            .method("PUT")
            .uri("/downloads?anon_hops=0")
            .header(header::CONTENT_TYPE, "application/x-bittorrent")
            .body(Body::from(def.to_bytes().unwrap()))
            .unwrap();
        self.send(request).await
    }
}

fn video_torrent() -> TorrentDef {
    let metainfo = bencode::dict([
        ("announce", bencode::string("http://tracker.example.com/announce")),
        (
            "info",
            bencode::dict([
                ("length", bencode::int(FILE_SIZE as i64)),
                ("name", bencode::string("clip.mp4")),
                ("piece length", bencode::int(1024)),
                ("pieces", bencode::bytes(vec![0u8; 60])),
            ]),
        ),
    ]);
    TorrentDef::load_from_dict(metainfo).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn write_payload(dir: &Path) -> Vec<u8> {
    let data: Vec<u8> = (0..=255u8).cycle().take(FILE_SIZE).collect();
    std::fs::write(dir.join("clip.mp4"), &data).unwrap();
    data
}

#[tokio::test]
async fn test_empty_listing_reports_checkpoints() {
    let fixture = Fixture::new();
    let response = fixture.send(get("/downloads")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["downloads"], json!([]));
    assert!(body["checkpoints"]["total"].is_number());
    assert!(body["checkpoints"]["all_loaded"].is_boolean());
}

#[tokio::test]
async fn test_add_torrent_body_and_list_details() {
    let fixture = Fixture::new();
    let def = video_torrent();
    let response = fixture.add_torrent(&def).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["started"], json!(true));
    assert_eq!(body["infohash"], json!(def.infohash().to_hex()));

    let response = fixture
        .send(get("/downloads?get_peers=1&get_pieces=1&get_availability=1"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let downloads = body["downloads"].as_array().unwrap();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0]["infohash"], json!(def.infohash().to_hex()));
    assert!(downloads[0]["peers"].is_array());
    assert!(downloads[0]["pieces"].is_string());
    assert!(downloads[0]["availability"].is_number());
}

#[tokio::test]
async fn test_infohash_filter_limits_details() {
    let fixture = Fixture::new();
    let def = video_torrent();
    fixture.add_torrent(&def).await;

    let other = "0123456789abcdef0123456789abcdef01234567";
    let response = fixture
        .send(get(&format!("/downloads?get_pieces=1&infohash={other}")))
        .await;
    let body = body_json(response).await;
    assert_eq!(body["downloads"].as_array().unwrap().len(), 1);
    assert!(body["downloads"][0].get("pieces").is_none());

    let response = fixture.send(get("/downloads?infohash=xyz")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_add_magnet_uri() {
    let fixture = Fixture::new();
    let response = fixture
        .send(json_request(
            "PUT",
            "/downloads",
            json!({
                "uri": "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=clip",
                "anon_hops": 0,
                "safe_seeding": false,
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body["infohash"],
        json!("0123456789abcdef0123456789abcdef01234567")
    );
    assert_eq!(fixture.engine.get_downloads(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_add_rejects_hops_without_safe_seeding() {
    let fixture = Fixture::new();
    let response = fixture
        .send(json_request(
            "PUT",
            "/downloads",
            json!({
                "uri": "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
                "anon_hops": 2,
                "safe_seeding": false,
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("safe seeding"));

    let response = fixture
        .send(json_request("PUT", "/downloads", json!({"anon_hops": 0})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(fixture.engine.get_downloads(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_patch_requires_exactly_one_change() {
    let fixture = Fixture::new();
    let def = video_torrent();
    fixture.add_torrent(&def).await;
    let uri = format!("/downloads/{}", def.infohash().to_hex());

    let response = fixture
        .send(json_request(
            "PATCH",
            &uri,
            json!({"state": "stop", "selected_files": [0]}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = fixture
        .send(json_request("PATCH", &uri, json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = fixture
        .send(json_request("PATCH", &uri, json!({"state": "stop"})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["modified"], json!(true));

    let response = fixture
        .send(json_request("PATCH", &uri, json!({"state": "explode"})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = fixture
        .send(json_request("PATCH", &uri, json!({"state": "move_storage"})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_patch_selected_files_and_completed_dir() {
    let fixture = Fixture::new();
    let def = video_torrent();
    fixture.add_torrent(&def).await;
    let uri = format!("/downloads/{}", def.infohash().to_hex());

    let response = fixture
        .send(json_request("PATCH", &uri, json!({"selected_files": [0]})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = fixture
        .send(json_request("PATCH", &uri, json!({"selected_files": [4]})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let done = fixture.downloads.path().join("done");
    let response = fixture
        .send(json_request("PATCH", &uri, json!({"completed_dir": done})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let (_, config) = fixture
        .engine
        .get_download_def(def.infohash())
        .await
        .unwrap();
    assert_eq!(config.completed_dir, Some(done));
}

#[tokio::test]
async fn test_unknown_download_is_not_found() {
    let fixture = Fixture::new();
    let uri = "/downloads/0123456789abcdef0123456789abcdef01234567";
    let response = fixture
        .send(json_request("PATCH", uri, json!({"state": "resume"})))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = fixture
        .send(json_request("DELETE", uri, json!({"remove_data": false})))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = fixture.send(get(&format!("{uri}/stream/0"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_removes_download() {
    let fixture = Fixture::new();
    let def = video_torrent();
    fixture.add_torrent(&def).await;

    let response = fixture
        .send(json_request(
            "DELETE",
            &format!("/downloads/{}", def.infohash().to_hex()),
            json!({"remove_data": false}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["removed"], json!(true));

    let body = body_json(fixture.send(get("/downloads")).await).await;
    assert_eq!(body["downloads"], json!([]));
}

#[tokio::test]
async fn test_stream_serves_requested_range() {
    let fixture = Fixture::new();
    let data = write_payload(fixture.downloads.path());
    let def = video_torrent();
    fixture.add_torrent(&def).await;
    let uri = format!("/downloads/{}/stream/0", def.infohash().to_hex());

    let request = Request::builder()
        .uri(&uri)
        .header(header::RANGE, "bytes=1000-2499")
        .body(Body::empty())
        .unwrap();
    let response = fixture.send(request).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        "bytes 1000-2499/3000"
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1500");
    assert_eq!(body_bytes(response).await, data[1000..2500]);

    let response = fixture.send(get(&uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, data);
}

#[tokio::test]
async fn test_stream_range_past_end_not_satisfiable() {
    let fixture = Fixture::new();
    write_payload(fixture.downloads.path());
    let def = video_torrent();
    fixture.add_torrent(&def).await;

    let request = Request::builder()
        .uri(format!("/downloads/{}/stream/0", def.infohash().to_hex()))
        .header(header::RANGE, "bytes=5000-")
        .body(Body::empty())
        .unwrap();
    let response = fixture.send(request).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */3000");

    let response = fixture
        .send(get(&format!(
            "/downloads/{}/stream/7",
            def.infohash().to_hex()
        )))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
