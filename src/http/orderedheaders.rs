//! Request header list.
//!
//! Headers are kept in insertion order with the caller's spelling, looked
//! up case-insensitively, and may repeat unless set with
//! [`HeaderFlags::REPLACE`].

use crate::base::neterror::NetError;
use http::header::{HeaderName, HeaderValue};
use std::ops::BitOr;
use std::str::FromStr;

/// General headers (RFC 2616 section 4.5).
const GENERAL_HEADERS: &[&str] = &[
    "Cache-Control",
    "Connection",
    "Date",
    "Pragma",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Via",
    "Warning",
];

/// Request headers (RFC 2616 section 5.3) plus the entity headers a body
/// needs.
const REQUEST_HEADERS: &[&str] = &[
    "Accept",
    "Accept-Charset",
    "Accept-Encoding",
    "Accept-Language",
    "Authorization",
    "Expect",
    "From",
    "Host",
    "If-Match",
    "If-Modified-Since",
    "If-None-Match",
    "If-Range",
    "If-Unmodified-Since",
    "Max-Forwards",
    "Proxy-Authorization",
    "Range",
    "Referer",
    "TE",
    "User-Agent",
    "Content-Type",
    "Content-Length",
];

/// Options for [`RequestHeaders::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const NONE: HeaderFlags = HeaderFlags(0);
    /// Accept any token as name, not only the well-known request headers.
    pub const SKIP_CHECK: HeaderFlags = HeaderFlags(1);
    /// Replace existing values instead of adding another.
    pub const REPLACE: HeaderFlags = HeaderFlags(2);

    pub fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HeaderFlags {
    type Output = HeaderFlags;

    fn bitor(self, rhs: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.0 | rhs.0)
    }
}

/// Whether `name` is one of the general or request headers.
pub fn is_known_request_header(name: &str) -> bool {
    GENERAL_HEADERS
        .iter()
        .chain(REQUEST_HEADERS)
        .any(|known| known.eq_ignore_ascii_case(name))
}

/// Check a header before it goes on the wire.
///
/// CR and LF are rejected everywhere; unknown names only pass with
/// [`HeaderFlags::SKIP_CHECK`].
pub fn validate_header(name: &str, value: &str, flags: HeaderFlags) -> Result<(), NetError> {
    if HeaderName::from_str(name).is_err() {
        tracing::debug!(name, "invalid header name");
        return Err(NetError::InvalidHeader);
    }
    if HeaderValue::from_str(value).is_err() {
        tracing::debug!(name, "invalid header value");
        return Err(NetError::InvalidHeader);
    }
    if !flags.contains(HeaderFlags::SKIP_CHECK) && !is_known_request_header(name) {
        tracing::debug!(name, "header rejected by strict check");
        return Err(NetError::InvalidHeader);
    }
    Ok(())
}

/// Ordered, case-insensitive list of request headers.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    headers: Vec<(String, String)>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a header.
    pub fn set(&mut self, name: &str, value: &str, flags: HeaderFlags) -> Result<(), NetError> {
        validate_header(name, value, flags)?;
        self.insert(name, value, flags.contains(HeaderFlags::REPLACE));
        Ok(())
    }

    /// Add without validation; for headers the engine generates itself.
    pub(crate) fn insert(&mut self, name: &str, value: &str, replace: bool) {
        if replace {
            if let Some(pos) = self.position(name) {
                self.headers[pos].1 = value.to_string();
                let mut index = 0;
                self.headers.retain(|(n, _)| {
                    let keep = index <= pos || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|pos| self.headers[pos].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Append the `Name: value\r\n` lines to `out`.
    pub(crate) fn write_to(&self, out: &mut String) {
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}
