//! Engine error taxonomy.
//!
//! Errors that only affect caching (`CacheMiss`, `CacheWriteFailure`) are
//! absorbed by the engine and degrade to "serve without caching". Errors
//! that affect the requested content itself (`NetworkUnavailable`,
//! `NetworkFailure`) carry the request identity and are surfaced to the
//! original caller. Nothing here is fatal to the host process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("`{identity}` not found in cache")]
    CacheMiss { identity: String },
    #[error("`{identity}` offline, cannot run fetch")]
    NetworkUnavailable { identity: String },
    #[error("`{identity}` could not be retrieved through the network: {message}")]
    NetworkFailure { identity: String, message: String },
    #[error("cache write failed: {message}")]
    CacheWriteFailure { message: String },
    #[error("population of cache generation {version} failed: {message}")]
    PopulationFailure { version: u32, message: String },
    #[error("control protocol error: {message}")]
    ProtocolError { message: String },
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl EngineError {
    pub fn cache_miss(identity: impl ToString) -> Self {
        Self::CacheMiss {
            identity: identity.to_string(),
        }
    }

    pub fn network_unavailable(identity: impl ToString) -> Self {
        Self::NetworkUnavailable {
            identity: identity.to_string(),
        }
    }

    pub fn network_failure(identity: impl ToString, message: impl std::fmt::Display) -> Self {
        Self::NetworkFailure {
            identity: identity.to_string(),
            message: message.to_string(),
        }
    }

    pub fn cache_write_failure(message: impl std::fmt::Display) -> Self {
        Self::CacheWriteFailure {
            message: message.to_string(),
        }
    }

    pub fn population_failure(version: u32, message: impl std::fmt::Display) -> Self {
        Self::PopulationFailure {
            version,
            message: message.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the alternate resolution path (cache vs. network) may
    /// still satisfy the request after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CacheMiss { .. }
                | Self::NetworkFailure { .. }
                | Self::NetworkUnavailable { .. }
                | Self::CacheWriteFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_errors_carry_the_identity() {
        let err = EngineError::network_failure("GET http://localhost/a", "connection reset");
        assert!(err.to_string().contains("GET http://localhost/a"));
        assert!(err.to_string().contains("connection reset"));

        let err = EngineError::network_unavailable("GET http://localhost/a");
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn recoverability() {
        assert!(EngineError::cache_miss("GET /a").is_recoverable());
        assert!(EngineError::network_failure("GET /a", "boom").is_recoverable());
        assert!(EngineError::cache_write_failure("quota").is_recoverable());
        assert!(!EngineError::population_failure(3, "asset missing").is_recoverable());
        assert!(!EngineError::protocol("unknown tag").is_recoverable());
    }
}
