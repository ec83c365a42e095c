use std::io::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use altc_core::Snapshot;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::{counter, histogram};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::CredentialSource;
use crate::backoff::{self, Attempt, Backoff, BackoffError};
use crate::{SendError, SnapshotSender};

pub const DEFAULT_ENDPOINT: &str = "http://altc-nodeserver:8080/kubernetes/resource";

/// Overall budget for one `send`, backoff sleeps included.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Serialize a snapshot to its JSON wire form, gzip-compressed when `gzip`.
pub fn encode(snapshot: &Snapshot, gzip: bool) -> Result<Vec<u8>, SendError> {
    let json = serde_json::to_vec(snapshot).map_err(|e| SendError::Encode(e.to_string()))?;
    if !gzip {
        return Ok(json);
    }
    let mut enc = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    enc.write_all(&json).map_err(|e| SendError::Encode(format!("gzip: {}", e)))?;
    enc.finish().map_err(|e| SendError::Encode(format!("gzip: {}", e)))
}

/// Delivers snapshots to the collector over HTTP with bearer auth.
pub struct HttpSender {
    http: reqwest::Client,
    endpoint: String,
    credentials: Arc<dyn CredentialSource>,
    gzip: bool,
    backoff: Backoff,
    timeout: Duration,
}

impl HttpSender {
    pub fn new(endpoint: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Result<Self, SendError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SendError::Transport(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            credentials,
            gzip: true,
            backoff: Backoff::default(),
            timeout: SEND_TIMEOUT,
        })
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    async fn post(&self, snapshot: &Snapshot) -> Result<(StatusCode, String), SendError> {
        let body = encode(snapshot, self.gzip)?;
        let credential = self.credentials.acquire().await?;
        let mut req = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&credential.token)
            .header(CONTENT_TYPE, "application/json");
        if self.gzip {
            req = req.header(CONTENT_ENCODING, "gzip");
        }
        let resp = req.body(body).send().await.map_err(|e| SendError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| SendError::Transport(format!("reading response: {}", e)))?;
        Ok((status, text))
    }

    async fn attempt(&self, snapshot: &Snapshot, n: u32) -> Attempt {
        counter!("altc_send_attempts_total", 1u64);
        match self.post(snapshot).await {
            Ok((StatusCode::OK, _)) => {
                debug!(attempt = n, snapshot_id = %snapshot.snapshot_id, "snapshot accepted");
                Attempt::Done
            }
            Ok((status, body)) => {
                counter!("altc_send_non_success_total", 1u64);
                warn!(attempt = n, status = %status, body = %body, "collector returned non-success status");
                Attempt::Done
            }
            Err(e) => {
                counter!("altc_send_failures_total", 1u64);
                warn!(attempt = n, error = %e, "send attempt failed");
                Attempt::Retry(e.to_string())
            }
        }
    }
}

#[async_trait::async_trait]
impl SnapshotSender for HttpSender {
    async fn register(&self) -> Result<(), SendError> {
        let credential = self.credentials.acquire().await?;
        info!(client_token_id = ?credential.client_token_id, endpoint = %self.endpoint, "registered with collector");
        Ok(())
    }

    async fn send(&self, snapshot: &Snapshot, cancel: &CancellationToken) -> Result<(), SendError> {
        let started = Instant::now();
        let run = backoff::retry(self.backoff, cancel, |n| self.attempt(snapshot, n));
        let res = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(attempts)) => {
                debug!(attempts, items = snapshot.len(), "snapshot delivered");
                Ok(())
            }
            Ok(Err(BackoffError::Exhausted { attempts, last })) => Err(SendError::Exhausted { attempts, last }),
            Ok(Err(BackoffError::Cancelled { attempts })) => {
                debug!(attempts, "send cancelled during backoff");
                Err(SendError::Cancelled)
            }
            Err(_) => Err(SendError::DeadlineExceeded(self.timeout)),
        };
        histogram!("altc_send_ms", started.elapsed().as_secs_f64() * 1000.0);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use altc_core::{Action, ResourceItem, SnapshotId};
    use flate2::read::GzDecoder;
    use std::io::Read as _;

    fn snapshot() -> Snapshot {
        Snapshot {
            cluster_name: "dev".into(),
            snapshot_id: SnapshotId::generate(),
            items: vec![ResourceItem::new(Action::Add, "Node", serde_json::json!({"metadata": {"name": "n1"}}))],
            batch: 0,
        }
    }

    #[test]
    fn plain_encoding_is_compact_json() {
        let snap = snapshot();
        let bytes = encode(&snap, false).unwrap();
        assert_eq!(bytes, serde_json::to_vec(&snap).unwrap());
    }

    #[test]
    fn gzip_encoding_inflates_to_the_same_json() {
        let snap = snapshot();
        let bytes = encode(&snap, true).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let mut out = Vec::new();
        GzDecoder::new(&bytes[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, serde_json::to_vec(&snap).unwrap());
    }
}
