//! Cache generation lifecycle.
//!
//! Owns generation versioning, bulk pre-population, stale-generation
//! cleanup, and the one-shot readiness gate. The strategy engine only
//! reads the active generation name and observes the gate; it never
//! creates or deletes generations.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Instant;

use futures::future::try_join_all;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fetch::{FetchMode, Fetcher};
use crate::identity::InterceptedRequest;
use crate::lock::{read_guard, write_guard};
use crate::store::{CacheStore, ResponseKind};
use crate::telemetry::{METRIC_GENERATION_SWAP_TOTAL, METRIC_POPULATION_MS};

const SOURCE: &str = "lifecycle";

/// Generation state machine.
///
/// `Populating(v')` is reachable from any `Ready(v)` when a new version
/// command arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Populating(u32),
    Ready(u32),
}

impl LifecycleState {
    pub fn version(&self) -> Option<u32> {
        match self {
            Self::Uninitialized => None,
            Self::Populating(version) | Self::Ready(version) => Some(*version),
        }
    }
}

/// Result of applying a version command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationOutcome {
    /// The generation set was created and populated.
    Populated(u32),
    /// The generation set already existed; nothing was fetched.
    AlreadyPopulated(u32),
}

/// Owns generation transitions and the readiness gate.
pub struct LifecycleManager {
    config: EngineConfig,
    serving_origin: Url,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    state: RwLock<LifecycleState>,
    active_set: RwLock<Option<String>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl LifecycleManager {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, EngineError> {
        let serving_origin = config.serving_origin_url()?;
        let (ready_tx, ready_rx) = watch::channel(false);
        Ok(Self {
            config,
            serving_origin,
            store,
            fetcher,
            state: RwLock::new(LifecycleState::Uninitialized),
            active_set: RwLock::new(None),
            ready_tx,
            ready_rx,
        })
    }

    /// Immutable snapshot of the current state.
    pub fn state(&self) -> LifecycleState {
        *read_guard(&self.state, SOURCE, "state")
    }

    /// Name of the currently active generation set, if any.
    pub fn active_set(&self) -> Option<String> {
        read_guard(&self.active_set, SOURCE, "active_set").clone()
    }

    /// Whether the first population has completed.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait for the readiness gate. Once ready, always ready.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        // The sender lives as long as self, so wait_for cannot fail here.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Apply a version-update command: populate the new set, then
    /// (after the settling delay) move the active pointer and clean up
    /// stale generations. Re-applying an existing version is a no-op
    /// that fetches nothing.
    #[instrument(skip(self, assets), fields(asset_count = assets.len()))]
    pub async fn apply_version(
        &self,
        version: u32,
        assets: &[String],
    ) -> Result<PopulationOutcome, EngineError> {
        let set = self.config.set_name(version);

        if self.store.exists(&set).await {
            debug!(
                target_module = SOURCE,
                version,
                set = %set,
                "generation already populated, skipping"
            );
            self.finish_swap(version, &set).await;
            return Ok(PopulationOutcome::AlreadyPopulated(version));
        }

        let previous = self.state();
        *write_guard(&self.state, SOURCE, "apply_version.populating") =
            LifecycleState::Populating(version);

        let population_started_at = Instant::now();
        if let Err(message) = self.populate(&set, assets).await {
            // All-or-nothing: drop the partial set so a retry repopulates.
            self.store.delete_set(&set).await;
            *write_guard(&self.state, SOURCE, "apply_version.restore") = previous;
            warn!(
                target_module = SOURCE,
                version,
                set = %set,
                error = %message,
                "population failed, previous generation remains in effect"
            );
            return Err(EngineError::population_failure(version, message));
        }
        histogram!(METRIC_POPULATION_MS)
            .record(population_started_at.elapsed().as_secs_f64() * 1000.0);

        info!(
            target_module = SOURCE,
            version,
            set = %set,
            asset_count = assets.len(),
            "population complete"
        );

        self.finish_swap(version, &set).await;
        Ok(PopulationOutcome::Populated(version))
    }

    /// Populate under the current version, or the configured initial
    /// version when no generation exists yet.
    pub async fn store_app_cache(
        &self,
        assets: &[String],
    ) -> Result<PopulationOutcome, EngineError> {
        let version = self
            .state()
            .version()
            .unwrap_or(self.config.initial_version);
        self.apply_version(version, assets).await
    }

    /// Delete every managed set (generations and the runtime set),
    /// reporting a per-set result. An empty store is a success.
    pub async fn clear_all(&self) -> Vec<(String, bool)> {
        let mut targets: Vec<String> = self
            .store
            .set_names()
            .await
            .into_iter()
            .filter(|name| self.config.is_generation_set(name))
            .collect();
        targets.push(self.config.runtime_set.clone());

        let mut results = Vec::with_capacity(targets.len());
        for name in targets {
            let deleted = self.store.delete_set(&name).await;
            info!(target_module = SOURCE, set = %name, deleted, "cache set cleared");
            results.push((name, deleted));
        }
        results
    }

    /// Pure read: does any generation set exist.
    pub async fn has_app_cache(&self) -> bool {
        self.store
            .set_names()
            .await
            .iter()
            .any(|name| self.config.is_generation_set(name))
    }

    async fn delete_stale_generations(&self, keep: &str) {
        let stale: Vec<String> = self
            .store
            .set_names()
            .await
            .into_iter()
            .filter(|name| self.config.is_generation_set(name) && name != keep)
            .collect();

        for name in stale {
            self.store.delete_set(&name).await;
            info!(target_module = SOURCE, set = %name, "stale generation deleted");
        }
    }

    /// Bulk-fetch every asset into `set`. Any single failure fails the
    /// whole population. The set is created up front so an empty asset
    /// list still yields an existing (idempotently re-appliable)
    /// generation.
    async fn populate(&self, set: &str, assets: &[String]) -> Result<(), String> {
        if !self.fetcher.is_online() {
            return Err("offline, cannot run population fetches".to_string());
        }

        self.store.create_set(set).await;
        try_join_all(assets.iter().map(|asset| self.populate_one(set, asset))).await?;
        Ok(())
    }

    async fn populate_one(&self, set: &str, asset: &str) -> Result<(), String> {
        let url = Url::parse(asset)
            .or_else(|_| self.serving_origin.join(asset))
            .map_err(|err| format!("invalid asset url `{asset}`: {err}"))?;

        let request = InterceptedRequest::get(url);
        let mode = if request.is_same_origin(&self.serving_origin) {
            FetchMode::Normal
        } else {
            FetchMode::Degraded
        };

        let fetched = self
            .fetcher
            .fetch(&request, mode)
            .await
            .map_err(|err| format!("`{asset}`: {err}"))?;

        if fetched.kind == ResponseKind::Normal && !fetched.is_ok() {
            return Err(format!(
                "`{asset}`: unexpected status {} during population",
                fetched.status
            ));
        }

        let identity = request.identity();
        self.store
            .insert(set, &identity, fetched.into_stored(set))
            .await
            .map_err(|err| format!("`{asset}`: {err}"))?;
        Ok(())
    }

    /// Ordered tail of a version command: gate-fire, settle, swap,
    /// stale-generation cleanup. Older generations are deleted only
    /// after the new one is in effect, so a failed population never
    /// destroys the set requests are being served from.
    async fn finish_swap(&self, version: u32, set: &str) {
        self.fire_ready();

        let delay = self.config.settle_delay();
        if !delay.is_zero() {
            // Drain requests that captured the previous generation's name.
            tokio::time::sleep(delay).await;
        }

        *write_guard(&self.active_set, SOURCE, "finish_swap.active") = Some(set.to_string());
        *write_guard(&self.state, SOURCE, "finish_swap.state") = LifecycleState::Ready(version);
        counter!(METRIC_GENERATION_SWAP_TOTAL).increment(1);
        info!(target_module = SOURCE, version, set, "generation swap complete");

        self.delete_stale_generations(set).await;
    }

    fn fire_ready(&self) {
        if !self.is_ready() {
            let _ = self.ready_tx.send(true);
            info!(target_module = SOURCE, "readiness gate fired");
        }
    }
}
