//! Error context helpers.
//!
//! Extension traits turning `io::Error` into `NetError` at the point where
//! the host, port or socket the error belongs to is still known.

use crate::base::neterror::NetError;
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Attach the connect target to an IO error.
    ///
    /// ```ignore
    /// use netloop::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 80)?;
    /// // Error: "Connection to example.com:80 failed: connection refused"
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Attach the looked-up name to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;

    /// Classify an IO error raised on an established socket.
    fn socket_context(self) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| NetError::connection_failed_to(host, port, e))
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }

    fn socket_context(self) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::trace!(error = %e, kind = ?e.kind(), "socket error");
            NetError::from(e)
        })
    }
}
