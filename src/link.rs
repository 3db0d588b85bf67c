//! Opaque links that round-trip through the `nexus-link` header.
//!
//! The runtime does not interpret link values. It only guarantees that an
//! ordered sequence of links written onto a request is recovered on the
//! other side byte-for-byte, one header entry per link.

use http::{HeaderMap, HeaderValue};
use thiserror::Error;

use crate::HEADER_LINK;

/// A single opaque link value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link(String);

impl Link {
    /// Wrap a raw link value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw link value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Link {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Link {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Link {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A link value cannot be represented as an HTTP header, or a received
/// header value is not a valid link.
#[derive(Debug, Clone, Error)]
#[error("invalid link header value")]
pub struct InvalidLink;

/// Append `links` in order onto `headers`.
///
/// # Errors
///
/// Returns [`InvalidLink`] when a value contains bytes that cannot appear in
/// an HTTP header.
pub(crate) fn add_links_to_headers(
    links: &[Link],
    headers: &mut HeaderMap,
) -> Result<(), InvalidLink> {
    for link in links {
        let value = HeaderValue::from_str(link.as_str()).map_err(|_| InvalidLink)?;
        headers.append(HEADER_LINK, value);
    }
    Ok(())
}

/// Decode the ordered link sequence from `headers`.
///
/// # Errors
///
/// Returns [`InvalidLink`] when a header entry holds opaque non-text bytes.
pub(crate) fn links_from_headers(headers: &HeaderMap) -> Result<Vec<Link>, InvalidLink> {
    headers
        .get_all(HEADER_LINK)
        .iter()
        .map(|value| value.to_str().map(Link::from).map_err(|_| InvalidLink))
        .collect()
}
