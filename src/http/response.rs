//! Response status line plus headers, and the assembled response.

use bytes::Bytes;
use http::StatusCode;
use url::Url;

/// Spellings of `Connection` that some servers send to defeat proxies.
const CONNECTION_HEADERS: &[&str] = &["Connection", "Cneonction", "nnCoection"];

/// Status line and headers of a response, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub(crate) version: String,
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub(crate) fn new(version: String, status: u16, reason: String) -> Self {
        Self {
            version,
            status,
            reason,
            headers: Vec::new(),
        }
    }

    /// Protocol token of the status line, e.g. `HTTP/1.1` or `ICY`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Typed status, when the code is in range for `http::StatusCode`.
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status).ok()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|(n, _)| n.as_str())
    }

    pub fn header_values(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|(_, v)| v.as_str())
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("Location")
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Server announced it will close the connection.
    pub fn connection_close(&self) -> bool {
        self.headers.iter().any(|(n, v)| {
            CONNECTION_HEADERS.iter().any(|c| c.eq_ignore_ascii_case(n))
                && v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
        })
    }

    /// Statuses that never carry a body.
    pub(crate) fn bodyless_status(&self) -> bool {
        (100..200).contains(&self.status) || self.status == 204 || self.status == 304
    }
}

/// A completed exchange: the final head, its body and where it came from.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    url: Url,
    head: ResponseHead,
    body: Bytes,
}

impl HttpResponse {
    pub(crate) fn new(url: Url, head: ResponseHead, body: Bytes) -> Self {
        Self { url, head, body }
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    /// URL of the final response, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
