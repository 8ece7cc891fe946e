//! Cache store contract and in-memory implementation.
//!
//! A store holds named sets mapping request identities to stored
//! responses. Inserts are first-write-wins: racing writers for the same
//! identity all observe the response that landed first, so concurrent
//! requests never duplicate a cache entry.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::identity::RequestIdentity;
use crate::lock::{read_guard, write_guard};

const SOURCE: &str = "store";

/// Storage-layer failure.
///
/// Callers on the request path swallow and log these; a caching failure
/// must never become a request failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage quota exceeded for set `{set}`")]
    QuotaExceeded { set: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Whether a response's status and headers can be introspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Same-origin response with a readable status.
    Normal,
    /// Cross-origin response fetched in degraded mode; status is
    /// unreadable and the response is cached without validation.
    Opaque,
}

/// Immutable snapshot of a response, tagged with the set it was stored
/// under. Never mutated after insertion; replacement is insert-then-evict.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub kind: ResponseKind,
    /// The generation (or runtime) set this snapshot belongs to.
    pub set: String,
}

impl StoredResponse {
    /// Opaque responses cannot be status-checked and count as ok.
    pub fn is_ok(&self) -> bool {
        self.kind == ResponseKind::Opaque || (200..300).contains(&self.status)
    }
}

/// Named, versioned key/value sets mapping request identities to stored
/// responses. Side effects are scoped to the backing storage.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a stored response in a set.
    async fn lookup(&self, set: &str, identity: &RequestIdentity) -> Option<StoredResponse>;

    /// Insert a response, first-write-wins.
    ///
    /// Inserting over an identity that already holds a response is a
    /// no-op returning the existing response.
    async fn insert(
        &self,
        set: &str,
        identity: &RequestIdentity,
        response: StoredResponse,
    ) -> Result<StoredResponse, StoreError>;

    /// Ensure a set exists, creating it empty when absent. Existing
    /// entries are untouched.
    async fn create_set(&self, set: &str);

    /// Whether a set exists.
    async fn exists(&self, set: &str) -> bool;

    /// Delete a set. Returns true both when the set existed and was
    /// removed and when it never existed.
    async fn delete_set(&self, set: &str) -> bool;

    /// Names of all existing sets.
    async fn set_names(&self) -> Vec<String>;
}

/// In-memory cache store.
///
/// An optional per-set capacity simulates storage quota exhaustion,
/// which is how write-failure behavior is exercised in tests.
pub struct MemoryStore {
    sets: RwLock<HashMap<String, HashMap<RequestIdentity, StoredResponse>>>,
    set_capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            set_capacity: None,
        }
    }

    /// A store whose sets refuse inserts beyond `capacity` entries.
    pub fn with_set_capacity(capacity: usize) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            set_capacity: Some(capacity),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn lookup(&self, set: &str, identity: &RequestIdentity) -> Option<StoredResponse> {
        read_guard(&self.sets, SOURCE, "lookup")
            .get(set)
            .and_then(|entries| entries.get(identity))
            .cloned()
    }

    async fn insert(
        &self,
        set: &str,
        identity: &RequestIdentity,
        mut response: StoredResponse,
    ) -> Result<StoredResponse, StoreError> {
        let mut sets = write_guard(&self.sets, SOURCE, "insert");
        let entries = sets.entry(set.to_string()).or_default();

        if let Some(existing) = entries.get(identity) {
            return Ok(existing.clone());
        }

        if let Some(capacity) = self.set_capacity
            && entries.len() >= capacity
        {
            return Err(StoreError::QuotaExceeded {
                set: set.to_string(),
            });
        }

        response.set = set.to_string();
        entries.insert(identity.clone(), response.clone());
        Ok(response)
    }

    async fn create_set(&self, set: &str) {
        write_guard(&self.sets, SOURCE, "create_set")
            .entry(set.to_string())
            .or_default();
    }

    async fn exists(&self, set: &str) -> bool {
        read_guard(&self.sets, SOURCE, "exists").contains_key(set)
    }

    async fn delete_set(&self, set: &str) -> bool {
        write_guard(&self.sets, SOURCE, "delete_set").remove(set);
        true
    }

    async fn set_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read_guard(&self.sets, SOURCE, "set_names")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
