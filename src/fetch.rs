//! Network fetch seam.
//!
//! The `Fetcher` trait is the engine's only path to the network. Offline
//! detection is synchronous so a known-offline client short-circuits a
//! fetch without waiting on a network-stack timeout.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::identity::InterceptedRequest;
use crate::store::{ResponseKind, StoredResponse};

const SOURCE: &str = "fetch";

/// How a fetch is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Same-origin fetch with a fully readable response.
    Normal,
    /// Cross-origin fetch that deliberately accepts an opaque
    /// (status-unreadable) response rather than failing outright.
    Degraded,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network request failed: {0}")]
    Transport(String),
}

/// A response as it came off the network, before it is stored anywhere.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub kind: ResponseKind,
}

impl FetchedResponse {
    /// Opaque responses cannot be status-checked and count as ok.
    pub fn is_ok(&self) -> bool {
        self.kind == ResponseKind::Opaque || (200..300).contains(&self.status)
    }

    /// Snapshot this response for storage under `set`.
    pub fn into_stored(self, set: &str) -> StoredResponse {
        StoredResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
            kind: self.kind,
            set: set.to_string(),
        }
    }
}

/// Network access for the engine.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Synchronous connectivity signal, checked before any fetch.
    fn is_online(&self) -> bool;

    /// Issue a network fetch for the request.
    async fn fetch(
        &self,
        request: &InterceptedRequest,
        mode: FetchMode,
    ) -> Result<FetchedResponse, FetchError>;
}

/// `reqwest`-backed fetcher.
///
/// Degraded-mode responses are surfaced as opaque: the status and
/// headers are erased so callers cannot introspect them, mirroring what
/// a cross-origin no-cors fetch would yield.
pub struct HttpFetcher {
    client: reqwest::Client,
    online: AtomicBool,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Update the connectivity signal from the host environment.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    async fn fetch(
        &self,
        request: &InterceptedRequest,
        mode: FetchMode,
    ) -> Result<FetchedResponse, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());
        if let Some(accept) = &request.accept {
            builder = builder.header(http::header::ACCEPT, accept);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        debug!(
            target_module = SOURCE,
            url = %request.url,
            status,
            mode = ?mode,
            bytes = body.len(),
            "fetch complete"
        );

        match mode {
            FetchMode::Normal => Ok(FetchedResponse {
                status,
                headers,
                body,
                kind: ResponseKind::Normal,
            }),
            FetchMode::Degraded => Ok(FetchedResponse {
                status: 0,
                headers: Vec::new(),
                body,
                kind: ResponseKind::Opaque,
            }),
        }
    }
}
