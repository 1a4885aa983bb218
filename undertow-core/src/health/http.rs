//! HTTP multi-scrape session (BEP-48).

use std::time::Duration;

use async_trait::async_trait;

use super::HealthError;
use super::session::{
    RetryPolicy, ScrapeResult, SessionInfo, SessionState, TrackerResponse, TrackerSession,
    TrackerUrl,
};
use crate::constants::{HTTP_RETRY_INTERVAL, HTTP_RETRY_MAX};
use crate::torrent::{InfoHash, bencode};

/// Scrapes an HTTP(S) tracker with one GET carrying every infohash.
pub struct HttpTrackerSession {
    info: SessionInfo,
    tracker: TrackerUrl,
    client: reqwest::Client,
}

impl HttpTrackerSession {
    /// # Errors
    /// - `HealthError::TrackerFailed` - HTTP client could not be built
    pub fn new(
        url: &str,
        tracker: TrackerUrl,
        timeout: Duration,
        capacity: usize,
    ) -> Result<Self, HealthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| HealthError::failed(url, e.to_string()))?;
        Ok(Self {
            info: SessionInfo::new(url, timeout, capacity),
            tracker,
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.tracker.host
    }

    /// Scrape URL with one `info_hash` parameter per attached infohash.
    pub fn scrape_url(&self) -> String {
        build_scrape_url(&self.info.url, &self.info.infohashes)
    }

    async fn scrape(&self) -> Result<Vec<ScrapeResult>, HealthError> {
        let url = &self.info.url;
        let response = self
            .client
            .get(self.scrape_url())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HealthError::Timeout { url: url.clone() }
                } else {
                    HealthError::failed(url, e.to_string())
                }
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(HealthError::failed(url, format!("HTTP status {}", status.as_u16())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| HealthError::failed(url, e.to_string()))?;
        parse_scrape_body(url, &self.info.infohashes, &body)
    }
}

#[async_trait]
impl TrackerSession for HttpTrackerSession {
    fn tracker_url(&self) -> &str {
        &self.info.url
    }

    fn infohashes(&self) -> &[InfoHash] {
        &self.info.infohashes
    }

    fn state(&self) -> SessionState {
        self.info.state
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: HTTP_RETRY_MAX,
            interval: HTTP_RETRY_INTERVAL,
            exponential: false,
        }
    }

    fn can_add_request(&self) -> bool {
        self.info.can_add_request()
    }

    fn add_infohash(&mut self, infohash: InfoHash) -> Result<(), HealthError> {
        self.info.add_infohash(infohash)
    }

    async fn connect_to_tracker(&mut self) -> Result<TrackerResponse, HealthError> {
        self.info.state = SessionState::Initiated;
        tracing::debug!(
            "Scraping {} for {} torrents",
            self.info.url,
            self.info.infohashes.len()
        );
        let result = self.scrape().await.map(|results| TrackerResponse {
            url: self.info.url.clone(),
            results,
        });
        if let Err(e) = &result {
            tracing::debug!("HTTP scrape of {} failed: {}", self.info.url, e);
        }
        self.info.finish(result)
    }
}

/// Replaces `/announce` with `/scrape` and appends the infohashes.
pub fn build_scrape_url(announce_url: &str, infohashes: &[InfoHash]) -> String {
    let base = announce_url.replace("/announce", "/scrape");
    let query = infohashes
        .iter()
        .map(|ih| format!("info_hash={}", urlencoding::encode_binary(ih.as_bytes())))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}

/// Parses a bencoded scrape body into per-infohash counts.
///
/// Every requested infohash gets a result; ones the tracker left out
/// count as `(0, 0)`.
///
/// # Errors
/// - `HealthError::TrackerFailed` - empty body or `failure reason`
/// - `HealthError::Protocol` - body is not a bencoded dictionary
pub fn parse_scrape_body(
    url: &str,
    requested: &[InfoHash],
    body: &[u8],
) -> Result<Vec<ScrapeResult>, HealthError> {
    if body.is_empty() {
        return Err(HealthError::failed(url, "empty response"));
    }
    let value = bencode::decode(body)
        .map_err(|e| HealthError::protocol(url, format!("invalid bencode: {e}")))?;
    if bencode::as_dict(&value).is_none() {
        return Err(HealthError::protocol(url, "response is not a dictionary"));
    }
    if let Some(reason) = bencode::get_str(&value, "failure reason") {
        return Err(HealthError::failed(url, reason));
    }

    let files = bencode::get(&value, "files").and_then(bencode::as_dict);
    let results = requested
        .iter()
        .map(|infohash| {
            let stats = files.and_then(|f| f.get(infohash.as_bytes().as_slice()));
            let count = |key: &str| {
                stats
                    .and_then(|s| bencode::get_int(s, key))
                    .map(|n| n.max(0) as u64)
                    .unwrap_or(0)
            };
            ScrapeResult::new(*infohash, count("complete"), count("incomplete"))
        })
        .collect();
    Ok(results)
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    use super::*;
    use crate::health::session::parse_tracker_url;

    const IH_A: [u8; 20] = [0xaa; 20];
    const IH_B: [u8; 20] = [0xbb; 20];

    fn scrape_body() -> Vec<u8> {
        let mut body = b"d5:filesd20:".to_vec();
        body.extend_from_slice(&IH_A);
        body.extend_from_slice(b"d8:completei7e10:incompletei3eeee");
        body
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/announce")
    }

    fn session(url: &str) -> HttpTrackerSession {
        let parsed = parse_tracker_url(url).unwrap();
        let mut session = HttpTrackerSession::new(url, parsed, Duration::from_secs(5), 74).unwrap();
        session.add_infohash(InfoHash::new(IH_A)).unwrap();
        session.add_infohash(InfoHash::new(IH_B)).unwrap();
        session
    }

    #[test]
    fn test_scrape_url_encoding() {
        let url = build_scrape_url(
            "http://tracker.example.org:8080/announce",
            &[InfoHash::new([0x01; 20]), InfoHash::new([0xfe; 20])],
        );
        assert!(url.starts_with("http://tracker.example.org:8080/scrape?info_hash=%01%01"));
        assert_eq!(url.matches("info_hash=").count(), 2);
        assert!(url.contains("&info_hash=%FE%FE"));

        let with_query = build_scrape_url("http://t.example.org/announce?key=1", &[InfoHash::new([0; 20])]);
        assert!(with_query.starts_with("http://t.example.org/scrape?key=1&info_hash="));
    }

    #[test]
    fn test_missing_infohash_counts_zero() {
        let results = parse_scrape_body(
            "http://t/announce",
            &[InfoHash::new(IH_A), InfoHash::new(IH_B)],
            &scrape_body(),
        )
        .unwrap();
        assert_eq!(
            results,
            vec![
                ScrapeResult::new(InfoHash::new(IH_A), 7, 3),
                ScrapeResult::new(InfoHash::new(IH_B), 0, 0),
            ]
        );
    }

    #[test]
    fn test_failure_reason_and_garbage() {
        let err = parse_scrape_body("http://t/announce", &[], b"d14:failure reason6:bannede").unwrap_err();
        assert_eq!(err.message(), "banned");
        assert!(matches!(
            parse_scrape_body("http://t/announce", &[], b"<html>"),
            Err(HealthError::Protocol { .. })
        ));
        assert!(matches!(
            parse_scrape_body("http://t/announce", &[], b""),
            Err(HealthError::TrackerFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_scrape_against_local_tracker() {
        let router = Router::new().route("/scrape", get(|| async { scrape_body() }));
        let url = serve(router).await;
        let mut session = session(&url);

        let response = session.connect_to_tracker().await.unwrap();
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(response.results[0].seeders, 7);
        assert_eq!(response.results[1], ScrapeResult::new(InfoHash::new(IH_B), 0, 0));
        assert!(!session.can_add_request());
    }

    #[tokio::test]
    async fn test_non_200_fails_session() {
        let router = Router::new().route("/scrape", get(|| async { (StatusCode::NOT_FOUND, "nope") }));
        let url = serve(router).await;
        let mut session = session(&url);

        let err = session.connect_to_tracker().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Failed);
        assert!(err.message().contains("404"));
    }

    #[tokio::test]
    async fn test_empty_body_fails_session() {
        let router = Router::new().route("/scrape", get(|| async { "" }));
        let url = serve(router).await;
        let mut session = session(&url);
        assert!(session.connect_to_tracker().await.is_err());
        assert_eq!(session.state(), SessionState::Failed);
    }
}
