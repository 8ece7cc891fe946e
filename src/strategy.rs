//! Resolution strategies.
//!
//! `Content` resources resolve network-first, `Image` and `Static`
//! cache-first. Every resolution waits on the readiness gate first. The
//! admission filter lets anything that is not a GET pass through to the
//! uninstrumented path untouched.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::classify::ResourceClass;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fetch::{FetchMode, FetchedResponse, Fetcher};
use crate::identity::{InterceptedRequest, RequestIdentity};
use crate::lifecycle::LifecycleManager;
use crate::store::{CacheStore, ResponseKind, StoredResponse};
use crate::telemetry::{
    METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_CACHE_WRITE_FAILURE_TOTAL,
    METRIC_NETWORK_FETCH_TOTAL,
};

const SOURCE: &str = "strategy";

/// Where a served response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeSource {
    /// Served from the named cache set without a network call.
    Cache { set: String },
    /// Fetched from the network and written through to the cache.
    Network,
    /// Fetched from the network but deliberately not cached
    /// (non-ok same-origin response, or a failed cache write).
    NetworkUncached,
}

/// A resolved response handed back to the caller.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: bytes::Bytes,
    pub kind: ResponseKind,
    pub source: ServeSource,
}

impl ServedResponse {
    fn from_cache(stored: StoredResponse) -> Self {
        Self {
            status: stored.status,
            headers: stored.headers,
            body: stored.body,
            kind: stored.kind,
            source: ServeSource::Cache { set: stored.set },
        }
    }

    fn from_network(stored: StoredResponse) -> Self {
        Self {
            status: stored.status,
            headers: stored.headers,
            body: stored.body,
            kind: stored.kind,
            source: ServeSource::Network,
        }
    }

    fn uncached(fetched: FetchedResponse) -> Self {
        Self {
            status: fetched.status,
            headers: fetched.headers,
            body: fetched.body,
            kind: fetched.kind,
            source: ServeSource::NetworkUncached,
        }
    }
}

/// Outcome of the admission filter plus resolution.
#[derive(Debug)]
pub enum Resolution {
    /// The request was intercepted and resolved.
    Served(ServedResponse),
    /// Not a read-only retrieval; the host dispatches it untouched.
    Passthrough,
}

/// Chooses and executes a resolution order per resource class.
pub struct StrategyEngine {
    config: EngineConfig,
    serving_origin: Url,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    lifecycle: Arc<LifecycleManager>,
    /// Per-identity guards coalescing concurrent cache-first misses so
    /// N racing requests produce one network fetch and one insert.
    inflight: Mutex<HashMap<RequestIdentity, Arc<Mutex<()>>>>,
}

impl StrategyEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Result<Self, EngineError> {
        let serving_origin = config.serving_origin_url()?;
        Ok(Self {
            config,
            serving_origin,
            store,
            fetcher,
            lifecycle,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Classify and resolve a request.
    #[instrument(skip_all, fields(url = %request.url, method = %request.method))]
    pub async fn resolve(&self, request: &InterceptedRequest) -> Result<Resolution, EngineError> {
        if request.method != Method::GET {
            debug!(
                target_module = SOURCE,
                method = %request.method,
                "not a retrieval request, passing through"
            );
            return Ok(Resolution::Passthrough);
        }

        let class = ResourceClass::from_accept(request.accept.as_deref());
        let identity = request.identity();
        debug!(
            target_module = SOURCE,
            identity = %identity,
            fingerprint = identity.fingerprint(),
            class = %class,
            "request intercepted"
        );

        self.lifecycle.ready().await;

        let served = match class {
            ResourceClass::Content => self.network_first(request, &identity, class).await?,
            ResourceClass::Image | ResourceClass::Static => {
                self.cache_first(request, &identity, class).await?
            }
        };
        Ok(Resolution::Served(served))
    }

    /// Network first, cache as fallback. A cache hit is never consulted
    /// while the network path is healthy.
    async fn network_first(
        &self,
        request: &InterceptedRequest,
        identity: &RequestIdentity,
        class: ResourceClass,
    ) -> Result<ServedResponse, EngineError> {
        match self.fetch_and_cache(request, identity).await {
            Ok(served) => Ok(served),
            Err(network_err) if network_err.is_recoverable() => {
                debug!(
                    target_module = SOURCE,
                    identity = %identity,
                    error = %network_err,
                    "network path failed, falling back to cache"
                );
                match self.cached(identity).await {
                    Ok(stored) => {
                        counter!(METRIC_CACHE_HIT_TOTAL, "class" => class.as_str()).increment(1);
                        Ok(ServedResponse::from_cache(stored))
                    }
                    Err(cache_err) => {
                        counter!(METRIC_CACHE_MISS_TOTAL, "class" => class.as_str()).increment(1);
                        debug!(
                            target_module = SOURCE,
                            error = %cache_err,
                            "no cached fallback remains"
                        );
                        Err(network_err)
                    }
                }
            }
            Err(network_err) => Err(network_err),
        }
    }

    /// Cache first, network as fallback. Concurrent misses for the same
    /// identity are coalesced behind a per-identity guard.
    async fn cache_first(
        &self,
        request: &InterceptedRequest,
        identity: &RequestIdentity,
        class: ResourceClass,
    ) -> Result<ServedResponse, EngineError> {
        match self.cached(identity).await {
            Ok(stored) => {
                counter!(METRIC_CACHE_HIT_TOTAL, "class" => class.as_str()).increment(1);
                return Ok(ServedResponse::from_cache(stored));
            }
            Err(cache_err) => {
                counter!(METRIC_CACHE_MISS_TOTAL, "class" => class.as_str()).increment(1);
                debug!(
                    target_module = SOURCE,
                    error = %cache_err,
                    "falling back to the network"
                );
            }
        }

        let guard = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        // A racing request may have completed the fetch while this one
        // waited on the guard.
        if let Ok(stored) = self.cached(identity).await {
            debug!(
                target_module = SOURCE,
                identity = %identity,
                "coalesced with an in-flight fetch"
            );
            return Ok(ServedResponse::from_cache(stored));
        }

        let result = self.fetch_and_cache(request, identity).await;
        self.inflight.lock().await.remove(identity);
        result
    }

    /// Active generation first, then the standing runtime set.
    async fn cached(&self, identity: &RequestIdentity) -> Result<StoredResponse, EngineError> {
        if let Some(set) = self.lifecycle.active_set()
            && let Some(stored) = self.store.lookup(&set, identity).await
        {
            return Ok(stored);
        }
        self.store
            .lookup(&self.config.runtime_set, identity)
            .await
            .ok_or_else(|| EngineError::cache_miss(identity))
    }

    /// Fetch from the network and write through to the runtime set.
    ///
    /// Offline fails fast before any network attempt. Cross-origin
    /// requests go out in degraded mode and cache the opaque result
    /// as-is. A same-origin non-ok response bypasses the cache write and
    /// is returned uncached. A failed cache write is logged and the
    /// response is still delivered.
    async fn fetch_and_cache(
        &self,
        request: &InterceptedRequest,
        identity: &RequestIdentity,
    ) -> Result<ServedResponse, EngineError> {
        if !self.fetcher.is_online() {
            return Err(EngineError::network_unavailable(identity));
        }

        let mode = if request.is_same_origin(&self.serving_origin) {
            FetchMode::Normal
        } else {
            FetchMode::Degraded
        };

        counter!(METRIC_NETWORK_FETCH_TOTAL).increment(1);
        let fetched = self
            .fetcher
            .fetch(request, mode)
            .await
            .map_err(|err| EngineError::network_failure(identity, err))?;

        if fetched.kind == ResponseKind::Normal && !fetched.is_ok() {
            debug!(
                target_module = SOURCE,
                identity = %identity,
                status = fetched.status,
                "non-ok response served uncached"
            );
            return Ok(ServedResponse::uncached(fetched));
        }

        let stored = fetched.clone().into_stored(&self.config.runtime_set);
        match self
            .store
            .insert(&self.config.runtime_set, identity, stored)
            .await
        {
            Ok(stored) => Ok(ServedResponse::from_network(stored)),
            Err(err) => {
                counter!(METRIC_CACHE_WRITE_FAILURE_TOTAL).increment(1);
                let write_failure = EngineError::cache_write_failure(err);
                warn!(
                    target_module = SOURCE,
                    identity = %identity,
                    error = %write_failure,
                    "cache write failed, serving response uncached"
                );
                Ok(ServedResponse::uncached(fetched))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::fetch::FetchError;
    use crate::store::MemoryStore;

    struct CountingFetcher {
        online: AtomicBool,
        fetches: AtomicUsize,
        status: u16,
        fail: bool,
        delay_ms: u64,
    }

    impl CountingFetcher {
        fn new() -> Self {
            Self {
                online: AtomicBool::new(true),
                fetches: AtomicUsize::new(0),
                status: 200,
                fail: false,
                delay_ms: 0,
            }
        }

        fn offline() -> Self {
            let fetcher = Self::new();
            fetcher.online.store(false, Ordering::Relaxed);
            fetcher
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn with_status(status: u16) -> Self {
            Self {
                status,
                ..Self::new()
            }
        }

        fn with_delay(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                ..Self::new()
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        fn is_online(&self) -> bool {
            self.online.load(Ordering::Relaxed)
        }

        async fn fetch(
            &self,
            request: &InterceptedRequest,
            mode: FetchMode,
        ) -> Result<FetchedResponse, FetchError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(FetchError::Transport("connection refused".to_string()));
            }
            match mode {
                FetchMode::Normal => Ok(FetchedResponse {
                    status: self.status,
                    headers: Vec::new(),
                    body: Bytes::from(format!("net:{}", request.url.path())),
                    kind: ResponseKind::Normal,
                }),
                FetchMode::Degraded => Ok(FetchedResponse {
                    status: 0,
                    headers: Vec::new(),
                    body: Bytes::from(format!("opaque:{}", request.url.path())),
                    kind: ResponseKind::Opaque,
                }),
            }
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            settle_delay_ms: 0,
            ..Default::default()
        }
    }

    async fn ready_engine(
        store: Arc<MemoryStore>,
        fetcher: Arc<CountingFetcher>,
    ) -> StrategyEngine {
        let lifecycle = Arc::new(
            LifecycleManager::new(test_config(), store.clone(), fetcher.clone())
                .expect("lifecycle"),
        );
        // First population (no assets) fires the readiness gate.
        lifecycle.apply_version(1, &[]).await.expect("populate");
        StrategyEngine::new(test_config(), store, fetcher, lifecycle).expect("engine")
    }

    fn url(s: &str) -> Url {
        Url::parse(s).expect("test url")
    }

    fn content_request(path: &str) -> InterceptedRequest {
        InterceptedRequest::get(url(&format!("http://localhost{path}")))
            .with_accept("text/html,application/xhtml+xml")
    }

    fn static_request(path: &str) -> InterceptedRequest {
        InterceptedRequest::get(url(&format!("http://localhost{path}")))
            .with_accept("text/css")
    }

    fn served(resolution: Resolution) -> ServedResponse {
        match resolution {
            Resolution::Served(response) => response,
            Resolution::Passthrough => panic!("expected a served response"),
        }
    }

    #[tokio::test]
    async fn non_get_requests_pass_through() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::new());
        let engine = ready_engine(store, fetcher.clone()).await;

        let request = InterceptedRequest::get(url("http://localhost/submit"))
            .with_method(Method::POST);
        let resolution = engine.resolve(&request).await.expect("resolve");

        assert!(matches!(resolution, Resolution::Passthrough));
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn cache_first_hit_makes_no_network_call() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::new());
        let engine = ready_engine(store, fetcher.clone()).await;
        let request = static_request("/style.css");

        // Miss populates the runtime set.
        served(engine.resolve(&request).await.expect("first"));
        assert_eq!(fetcher.fetch_count(), 1);

        // Hit: zero additional fetches.
        let response = served(engine.resolve(&request).await.expect("second"));
        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(
            response.source,
            ServeSource::Cache {
                set: "fetch-cache".to_string()
            }
        );
    }

    #[tokio::test]
    async fn network_first_fetches_despite_cache_hit() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::new());
        let engine = ready_engine(store, fetcher.clone()).await;
        let request = content_request("/index.html");

        served(engine.resolve(&request).await.expect("first"));
        let after_first = fetcher.fetch_count();

        // Cached now, but content still goes to the network first.
        let response = served(engine.resolve(&request).await.expect("second"));
        assert_eq!(fetcher.fetch_count(), after_first + 1);
        assert_eq!(response.source, ServeSource::Network);
    }

    #[tokio::test]
    async fn network_first_falls_back_to_cache_on_failure() {
        let store = Arc::new(MemoryStore::new());
        let healthy = Arc::new(CountingFetcher::new());
        let engine = ready_engine(store.clone(), healthy.clone()).await;
        let request = content_request("/index.html");

        served(engine.resolve(&request).await.expect("warm the cache"));

        // Same store, failing network.
        let failing = Arc::new(CountingFetcher::failing());
        let lifecycle = Arc::new(
            LifecycleManager::new(test_config(), store.clone(), failing.clone())
                .expect("lifecycle"),
        );
        lifecycle.apply_version(1, &[]).await.expect("ready");
        let engine =
            StrategyEngine::new(test_config(), store, failing, lifecycle).expect("engine");

        let response = served(engine.resolve(&request).await.expect("fallback"));
        assert!(matches!(response.source, ServeSource::Cache { .. }));
    }

    #[tokio::test]
    async fn network_first_surfaces_failure_when_cache_also_misses() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::failing());
        let engine = ready_engine(store, fetcher).await;

        let err = engine
            .resolve(&content_request("/index.html"))
            .await
            .expect_err("no fallback remains");
        assert!(matches!(err, EngineError::NetworkFailure { .. }));
        assert!(err.to_string().contains("http://localhost/index.html"));
    }

    #[tokio::test]
    async fn offline_fails_fast_without_network_attempt() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::offline());
        let lifecycle = Arc::new(
            LifecycleManager::new(test_config(), store.clone(), fetcher.clone())
                .expect("lifecycle"),
        );
        // Fire the gate without going through population.
        let online = Arc::new(CountingFetcher::new());
        let warmup = LifecycleManager::new(test_config(), store.clone(), online)
            .expect("warmup lifecycle");
        warmup.apply_version(1, &[]).await.expect("ready");
        lifecycle.apply_version(1, &[]).await.expect("ready");

        let engine = StrategyEngine::new(test_config(), store, fetcher.clone(), lifecycle)
            .expect("engine");

        let before = fetcher.fetch_count();
        let err = engine
            .resolve(&static_request("/style.css"))
            .await
            .expect_err("offline with empty cache");
        assert!(matches!(err, EngineError::NetworkUnavailable { .. }));
        assert_eq!(fetcher.fetch_count(), before);
    }

    #[tokio::test]
    async fn cross_origin_responses_are_cached_opaque() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::new());
        let engine = ready_engine(store.clone(), fetcher).await;

        let request = InterceptedRequest::get(url("https://cdn.example.com/pic.jpg"))
            .with_accept("image/avif,image/webp");
        let response = served(engine.resolve(&request).await.expect("resolve"));

        assert_eq!(response.kind, ResponseKind::Opaque);
        assert_eq!(response.source, ServeSource::Network);

        let stored = store
            .lookup("fetch-cache", &request.identity())
            .await
            .expect("cached as-is");
        assert_eq!(stored.kind, ResponseKind::Opaque);
        assert_eq!(stored.status, 0);
    }

    #[tokio::test]
    async fn non_ok_same_origin_response_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::with_status(404));
        let engine = ready_engine(store.clone(), fetcher).await;
        let request = static_request("/missing.css");

        let response = served(engine.resolve(&request).await.expect("resolve"));
        assert_eq!(response.status, 404);
        assert_eq!(response.source, ServeSource::NetworkUncached);
        assert!(
            store
                .lookup("fetch-cache", &request.identity())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn cache_write_failure_still_serves_the_response() {
        // Capacity zero: every insert fails with a quota error.
        let store = Arc::new(MemoryStore::with_set_capacity(0));
        let fetcher = Arc::new(CountingFetcher::new());
        let engine = ready_engine(store, fetcher).await;

        let response = served(
            engine
                .resolve(&static_request("/style.css"))
                .await
                .expect("a caching failure must never fail the request"),
        );
        assert_eq!(response.status, 200);
        assert_eq!(response.source, ServeSource::NetworkUncached);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::with_delay(20));
        let engine = Arc::new(ready_engine(store, fetcher.clone()).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                served(
                    engine
                        .resolve(&static_request("/shared.css"))
                        .await
                        .expect("resolve"),
                )
            }));
        }

        let mut bodies = Vec::new();
        for handle in handles {
            bodies.push(handle.await.expect("join").body);
        }

        assert_eq!(fetcher.fetch_count(), 1);
        assert!(bodies.iter().all(|body| body == &bodies[0]));
    }

    #[tokio::test]
    async fn lookup_prefers_active_generation_over_runtime_set() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher::new());
        let lifecycle = Arc::new(
            LifecycleManager::new(test_config(), store.clone(), fetcher.clone())
                .expect("lifecycle"),
        );
        lifecycle
            .apply_version(1, &["/style.css".to_string()])
            .await
            .expect("populate");
        let engine = StrategyEngine::new(test_config(), store, fetcher.clone(), lifecycle)
            .expect("engine");

        let response = served(
            engine
                .resolve(&static_request("/style.css"))
                .await
                .expect("resolve"),
        );
        assert_eq!(
            response.source,
            ServeSource::Cache {
                set: "app-v1".to_string()
            }
        );
        // One fetch during population, none at resolve time.
        assert_eq!(fetcher.fetch_count(), 1);
    }
}
