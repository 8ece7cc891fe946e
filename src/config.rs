//! Engine configuration.
//!
//! Controls cache set naming, the generation settling delay, and the
//! serving origin used for cross-origin detection.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::EngineError;

// Default values for engine configuration
const DEFAULT_SERVING_ORIGIN: &str = "http://localhost";
const DEFAULT_GENERATION_PREFIX: &str = "app-v";
const DEFAULT_RUNTIME_SET: &str = "fetch-cache";
const DEFAULT_INITIAL_VERSION: u32 = 1;
const DEFAULT_SETTLE_DELAY_MS: u64 = 300;

/// Engine configuration.
///
/// The settling delay before a generation swap is a tunable, not a
/// contract; it exists to drain requests that captured the previous
/// generation's name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Origin the engine serves for; anything else is cross-origin.
    pub serving_origin: String,
    /// Naming prefix for versioned generation sets (`prefix + version`).
    pub generation_prefix: String,
    /// Name of the standing set for opportunistic write-through entries.
    pub runtime_set: String,
    /// Version used by `StoreInAppCache` before any generation exists.
    pub initial_version: u32,
    /// Delay (ms) between a finished population and the generation swap.
    pub settle_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            serving_origin: DEFAULT_SERVING_ORIGIN.to_string(),
            generation_prefix: DEFAULT_GENERATION_PREFIX.to_string(),
            runtime_set: DEFAULT_RUNTIME_SET.to_string(),
            initial_version: DEFAULT_INITIAL_VERSION,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

impl EngineConfig {
    /// Derived set name for a generation version.
    pub fn set_name(&self, version: u32) -> String {
        format!("{}{}", self.generation_prefix, version)
    }

    /// Whether a set name belongs to this engine's generation namespace.
    ///
    /// The runtime set and unrelated sets are never treated as generations,
    /// so stale-generation cleanup leaves them alone.
    pub fn is_generation_set(&self, name: &str) -> bool {
        name != self.runtime_set && name.starts_with(&self.generation_prefix)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Parse the configured serving origin.
    pub fn serving_origin_url(&self) -> Result<Url, EngineError> {
        Url::parse(&self.serving_origin).map_err(|err| {
            EngineError::configuration(format!(
                "invalid serving origin `{}`: {err}",
                self.serving_origin
            ))
        })
    }
}
