//! Resource classification.
//!
//! Maps a request's Accept header to a resource class. Pure and
//! stateless; recomputed per request.

use std::fmt;

/// Resource class derived from the request's accept criteria.
///
/// The class selects the resolution strategy: `Content` is resolved
/// network-first, `Image` and `Static` cache-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Content,
    Image,
    Static,
}

impl ResourceClass {
    /// Classify from an Accept header.
    ///
    /// An absent or unrecognized header defaults to `Static`.
    pub fn from_accept(accept: Option<&str>) -> Self {
        match accept {
            Some(header) if header.contains("text/html") => Self::Content,
            Some(header) if header.contains("image") => Self::Image,
            _ => Self::Static,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Image => "image",
            Self::Static => "static",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
