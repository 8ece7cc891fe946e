//! Control channel protocol and dispatch.
//!
//! A request/reply protocol layered over a one-message, one-reply
//! transport. Senders that provide no reply port get permanent silence
//! (fire-and-forget). Every handler replies through exactly one of a
//! success value or a structured `{error}` value; callers discriminate
//! by the shape of the reply, never by transport failure.
//!
//! The channel is independent of request flow: population commands and
//! cache-state queries are accepted even before the readiness gate
//! fires.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::lifecycle::{LifecycleManager, PopulationOutcome};

const SOURCE: &str = "control";

/// Fixed sentinel returned by the diagnostic no-op.
pub const DIAGNOSTIC_ANSWER: u64 = 42;

/// Reply for an idempotent population that found its work already done.
pub const ALREADY_POPULATED_STATUS: &str = "Caching was already done previously.";

/// The five recognized control messages, tagged by `type` on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Delete every managed cache set.
    ClearAllCache,
    /// Populate the app cache under the current (or initial) version.
    StoreInAppCache {
        #[serde(rename = "assetUrlsToCache")]
        asset_urls_to_cache: Vec<String>,
    },
    /// Pure read: does a populated generation exist.
    HasAppCache,
    /// Version-update command; fire-and-forget, drives the lifecycle.
    #[serde(rename = "CACHE")]
    Cache {
        #[serde(rename = "cacheVersion")]
        cache_version: u32,
        #[serde(rename = "assetUrlsToCache")]
        asset_urls_to_cache: Vec<String>,
    },
    /// Diagnostic no-op verifying the channel end-to-end.
    TheQuestion,
}

/// Reply shapes, serialized untagged so the wire forms match the
/// protocol: a list of booleans, a status string, a boolean, the
/// sentinel number, or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
    Cleared(Vec<bool>),
    Status(String),
    Has(bool),
    Answer(u64),
    Error { error: String },
}

impl ControlReply {
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            error: err.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// One message in flight: the raw JSON value plus an optional reply
/// port. No port means the sender never hears back.
pub struct ControlEnvelope {
    pub message: Value,
    pub reply_to: Option<oneshot::Sender<ControlReply>>,
}

/// Dispatches control messages to the lifecycle manager.
#[derive(Clone)]
pub struct ControlHandler {
    lifecycle: Arc<LifecycleManager>,
}

impl ControlHandler {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// Handle one raw message, always producing exactly one reply.
    pub async fn handle(&self, message: Value) -> ControlReply {
        let parsed: Result<ControlMessage, _> = serde_json::from_value(message);
        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                let protocol_err = EngineError::protocol(format!(
                    "malformed or unrecognized control message: {err}"
                ));
                warn!(target_module = SOURCE, error = %protocol_err, "control dispatch failed");
                return ControlReply::error(protocol_err);
            }
        };

        debug!(target_module = SOURCE, message = ?message, "control message received");

        match message {
            ControlMessage::ClearAllCache => {
                let results = self.lifecycle.clear_all().await;
                ControlReply::Cleared(results.into_iter().map(|(_, deleted)| deleted).collect())
            }
            ControlMessage::StoreInAppCache {
                asset_urls_to_cache,
            } => self.population_reply(
                self.lifecycle.store_app_cache(&asset_urls_to_cache).await,
            ),
            ControlMessage::HasAppCache => {
                ControlReply::Has(self.lifecycle.has_app_cache().await)
            }
            ControlMessage::Cache {
                cache_version,
                asset_urls_to_cache,
            } => self.population_reply(
                self.lifecycle
                    .apply_version(cache_version, &asset_urls_to_cache)
                    .await,
            ),
            ControlMessage::TheQuestion => ControlReply::Answer(DIAGNOSTIC_ANSWER),
        }
    }

    fn population_reply(
        &self,
        outcome: Result<PopulationOutcome, EngineError>,
    ) -> ControlReply {
        match outcome {
            Ok(PopulationOutcome::AlreadyPopulated(_)) => {
                ControlReply::Status(ALREADY_POPULATED_STATUS.to_string())
            }
            Ok(PopulationOutcome::Populated(version)) => {
                ControlReply::Status(format!("App cache stored for version {version}."))
            }
            Err(err) => ControlReply::error(err),
        }
    }
}

/// Sending half of the control transport.
#[derive(Clone)]
pub struct ControlPort {
    tx: mpsc::UnboundedSender<ControlEnvelope>,
}

impl ControlPort {
    /// Send a message and wait for its reply.
    pub async fn request(&self, message: Value) -> ControlReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = ControlEnvelope {
            message,
            reply_to: Some(reply_tx),
        };
        if self.tx.send(envelope).is_err() {
            return ControlReply::error("control channel closed");
        }
        match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => ControlReply::error("control channel closed before replying"),
        }
    }

    /// Send a message with no reply port (fire-and-forget).
    pub fn send(&self, message: Value) {
        let envelope = ControlEnvelope {
            message,
            reply_to: None,
        };
        if self.tx.send(envelope).is_err() {
            warn!(
                target_module = SOURCE,
                "fire-and-forget message dropped: control channel closed"
            );
        }
    }
}

/// Receiving half: drains envelopes and dispatches them one at a time.
pub struct ControlWorker {
    rx: mpsc::UnboundedReceiver<ControlEnvelope>,
    handler: ControlHandler,
}

impl ControlWorker {
    /// Process envelopes until every port is dropped.
    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            let reply = self.handler.handle(envelope.message).await;
            if let Some(reply_to) = envelope.reply_to {
                // The requester may have abandoned the reply; that is
                // not the worker's problem.
                let _ = reply_to.send(reply);
            } else if reply.is_error() {
                warn!(
                    target_module = SOURCE,
                    reply = ?reply,
                    "fire-and-forget message failed with no one listening"
                );
            }
        }
        debug!(target_module = SOURCE, "control worker stopped");
    }
}

/// Build a connected port/worker pair around a handler.
pub fn channel(handler: ControlHandler) -> (ControlPort, ControlWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlPort { tx }, ControlWorker { rx, handler })
}
