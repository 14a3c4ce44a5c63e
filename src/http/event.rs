//! Events reported by [`HttpConn`](super::HttpConn).

use super::response::ResponseHead;
use crate::base::neterror::NetError;
use bytes::Bytes;
use std::net::SocketAddr;

/// A redirect the exchange saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    /// Absolute target, resolved against the request URL.
    pub location: String,
    /// Redirects followed so far, this one included when `auto` is set.
    pub num_redirects: u32,
    pub max_redirects: u32,
    /// Whether the engine is following it.
    pub auto: bool,
}

/// Body progress carried by `DataPartial`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataProgress {
    /// Newly decoded bytes.
    pub chunk: Bytes,
    /// Body bytes received so far, `chunk` included.
    pub received: u64,
    /// `Content-Length`, when the response has one.
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum HttpEvent {
    /// Lookup of the server (or proxy) finished.
    Resolved(Result<SocketAddr, NetError>),
    Connected,
    /// Final status line and headers of a response.
    Response(ResponseHead),
    DataPartial(DataProgress),
    /// Body complete. Terminal.
    DataComplete { received: u64 },
    Redirect(RedirectInfo),
    /// Terminal.
    Error(NetError),
    /// No progress within the timeout. Terminal.
    Timeout,
}

impl HttpEvent {
    /// Whether the exchange is over after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HttpEvent::DataComplete { .. } | HttpEvent::Error(_) | HttpEvent::Timeout
        )
    }
}
