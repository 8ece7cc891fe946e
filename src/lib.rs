//! Scorta — an offline-first request interception and caching engine.
//!
//! Intercepted GET requests are classified from their Accept header and
//! resolved with a per-class strategy:
//!
//! - **Network-first** (`content`): fetch, write through, fall back to
//!   the cache on failure.
//! - **Cache-first** (`image`, `static`): serve a hit without touching
//!   the network; fetch and write through on a miss.
//!
//! Pre-populated assets live in versioned cache generations with an
//! atomic, settling-delayed cutover managed by the [`LifecycleManager`];
//! request resolution waits on a one-shot readiness gate until the first
//! generation finishes populating. An out-of-band [`control`] protocol
//! pre-populates, queries, and wipes the cache independently of request
//! flow.
//!
//! Hosts wire a [`Gateway`] over a [`CacheStore`] and a [`Fetcher`] and
//! register its two hooks in front of normal request dispatch.

mod classify;
mod config;
pub mod control;
mod error;
mod fetch;
mod gateway;
mod identity;
mod lifecycle;
mod lock;
mod store;
mod strategy;
pub mod telemetry;

pub use classify::ResourceClass;
pub use config::EngineConfig;
pub use control::{ControlHandler, ControlMessage, ControlPort, ControlReply, ControlWorker};
pub use error::EngineError;
pub use fetch::{FetchError, FetchMode, FetchedResponse, Fetcher, HttpFetcher};
pub use gateway::Gateway;
pub use identity::{InterceptedRequest, RequestIdentity};
pub use lifecycle::{LifecycleManager, LifecycleState, PopulationOutcome};
pub use store::{CacheStore, MemoryStore, ResponseKind, StoreError, StoredResponse};
pub use strategy::{Resolution, ServeSource, ServedResponse, StrategyEngine};
pub use telemetry::LogFormat;
