//! Request identity and the intercepted request shape.
//!
//! A `RequestIdentity` is the opaque key a cacheable unit is stored
//! under: method plus normalized URL. It is stable across retries of the
//! logically same request.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use http::Method;
use url::Url;

/// Opaque key identifying a cacheable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    method: String,
    url: String,
}

impl RequestIdentity {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            // Url parsing already normalizes scheme, host case, and
            // default ports, which keeps retries keyed identically.
            url: url.to_string(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stable hash for log correlation.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// An outbound request handed to the engine for resolution.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: Url,
    /// Accept header, when the client sent one.
    pub accept: Option<String>,
}

impl InterceptedRequest {
    /// A GET request with no Accept header.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            accept: None,
        }
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn identity(&self) -> RequestIdentity {
        RequestIdentity::new(&self.method, &self.url)
    }

    /// Whether this request targets the given serving origin.
    pub fn is_same_origin(&self, serving_origin: &Url) -> bool {
        self.url.origin() == serving_origin.origin()
    }
}
