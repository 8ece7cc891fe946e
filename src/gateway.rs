//! Engine wiring.
//!
//! A `Gateway` owns the lifecycle manager and strategy engine and
//! exposes exactly the two hooks a host environment registers:
//! "classify and resolve this request" and "handle this control
//! message". Hosts that want a message-pump transport instead of direct
//! calls can take a port/worker pair from `control_channel`.

use std::sync::Arc;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::control::{self, ControlHandler, ControlPort, ControlReply, ControlWorker};
use crate::error::EngineError;
use crate::fetch::Fetcher;
use crate::identity::InterceptedRequest;
use crate::lifecycle::LifecycleManager;
use crate::store::CacheStore;
use crate::strategy::{Resolution, StrategyEngine};

pub struct Gateway {
    lifecycle: Arc<LifecycleManager>,
    strategy: StrategyEngine,
    handler: ControlHandler,
}

impl Gateway {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, EngineError> {
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            store.clone(),
            fetcher.clone(),
        )?);
        let strategy = StrategyEngine::new(config, store, fetcher, lifecycle.clone())?;
        let handler = ControlHandler::new(lifecycle.clone());
        Ok(Self {
            lifecycle,
            strategy,
            handler,
        })
    }

    /// Hook 1: classify and resolve an intercepted request.
    pub async fn resolve(&self, request: &InterceptedRequest) -> Result<Resolution, EngineError> {
        self.strategy.resolve(request).await
    }

    /// Hook 2: handle a raw control message, producing exactly one reply.
    pub async fn handle_control(&self, message: Value) -> ControlReply {
        self.handler.handle(message).await
    }

    /// A transport-backed control channel bound to this gateway. The
    /// returned worker must be spawned; ports can be cloned freely.
    pub fn control_channel(&self) -> (ControlPort, ControlWorker) {
        control::channel(self.handler.clone())
    }

    /// The lifecycle manager, for observing generation state.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }
}
