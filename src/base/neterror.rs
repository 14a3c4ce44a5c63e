use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Broad failure classes surfaced to callers.
///
/// Every [`NetError`] maps onto exactly one class so callers can tell
/// "server too slow" apart from "server misbehaved" without matching on
/// individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Name not found or the lookup itself failed.
    ResolutionFailure,
    /// The peer refused or could not be reached.
    ConnectFailure,
    /// The peer sent something we cannot parse or accept.
    ProtocolError,
    /// No progress within the configured deadline.
    Timeout,
    /// Expected outcome of an explicit cancellation.
    Cancelled,
    /// Anything else (I/O errors on an established socket, bad arguments).
    Other,
}

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Generic
    #[error("Operation failed")]
    Failed,
    #[error("Operation aborted")]
    Aborted,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Unexpected state")]
    Unexpected,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("SOCKS connection failed")]
    SocksConnectionFailed,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("Name resolution failed")]
    NameResolutionFailed,
    #[error("Address in use")]
    AddressInUse,

    /// Connect failure with the target it was aimed at.
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },

    /// Resolution failure with the name that failed.
    #[error("Could not resolve {domain}: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid redirect")]
    InvalidRedirect,
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Invalid chunked encoding")]
    InvalidChunkedEncoding,
    #[error("Method not supported")]
    MethodNotSupported,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Response headers multiple Content-Length")]
    ResponseHeadersMultipleContentLength,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,

    // Custom codes (outside Chromium's table)
    #[error("Redirect cycle detected")]
    RedirectCycleDetected,
    #[error("Socket closed by remote")]
    SocketRemoteClosed,
    #[error("Invalid request header")]
    InvalidHeader,
    #[error("Both Transfer-Encoding and Content-Length present")]
    ConflictingFraming,
    #[error("Not an HTTP or ICY response")]
    UnsupportedProtocol,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Aborted => -3,
            NetError::InvalidArgument => -4,
            NetError::TimedOut => -7,
            NetError::Unexpected => -9,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::SocksConnectionFailed => -120,
            NetError::ProxyConnectionFailed => -130,
            NetError::NameResolutionFailed => -137,
            NetError::AddressInUse => -147,
            NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolvedFor { .. } => -105,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidRedirect => -303,
            NetError::TooManyRedirects => -310,
            NetError::InvalidResponse => -320,
            NetError::InvalidChunkedEncoding => -321,
            NetError::MethodNotSupported => -322,
            NetError::EmptyResponse => -324,
            NetError::ResponseHeadersTooBig => -325,
            NetError::ResponseHeadersMultipleContentLength => -346,
            NetError::ContentLengthMismatch => -354,
            NetError::IncompleteChunkedEncoding => -355,
            NetError::InvalidHttpResponse => -370,

            // Custom codes start at -10000 to stay clear of every Chromium range
            NetError::RedirectCycleDetected => -10000,
            NetError::SocketRemoteClosed => -10001,
            NetError::InvalidHeader => -10002,
            NetError::ConflictingFraming => -10003,
            NetError::UnsupportedProtocol => -10004,
            NetError::Unknown(code) => *code,
        }
    }

    /// Numeric code reported alongside the message in error events.
    pub fn code(&self) -> i32 {
        self.as_i32()
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            NetError::NameNotResolved
            | NetError::NameNotResolvedFor { .. }
            | NetError::NameResolutionFailed => ErrorClass::ResolutionFailure,

            NetError::ConnectionRefused
            | NetError::ConnectionFailed
            | NetError::ConnectionFailedTo { .. }
            | NetError::AddressInvalid
            | NetError::AddressUnreachable
            | NetError::AddressInUse
            | NetError::SocksConnectionFailed
            | NetError::ProxyConnectionFailed => ErrorClass::ConnectFailure,

            NetError::InvalidRedirect
            | NetError::TooManyRedirects
            | NetError::RedirectCycleDetected
            | NetError::InvalidResponse
            | NetError::InvalidChunkedEncoding
            | NetError::EmptyResponse
            | NetError::ResponseHeadersTooBig
            | NetError::ResponseHeadersMultipleContentLength
            | NetError::ContentLengthMismatch
            | NetError::IncompleteChunkedEncoding
            | NetError::InvalidHttpResponse
            | NetError::InvalidHeader
            | NetError::ConflictingFraming
            | NetError::UnsupportedProtocol => ErrorClass::ProtocolError,

            NetError::TimedOut | NetError::ConnectionTimedOut => ErrorClass::Timeout,

            NetError::Aborted => ErrorClass::Cancelled,

            _ => ErrorClass::Other,
        }
    }

    pub fn is_protocol_error(&self) -> bool {
        self.class() == ErrorClass::ProtocolError
    }

    pub(crate) fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        NetError::ConnectionFailedTo {
            host: host.to_string(),
            port,
            source: Arc::new(source),
        }
    }

    pub(crate) fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
            io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            io::ErrorKind::NotConnected => NetError::SocketNotConnected,
            io::ErrorKind::AddrInUse => NetError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            _ => NetError::Failed,
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Aborted,
            -4 => NetError::InvalidArgument,
            -7 => NetError::TimedOut,
            -9 => NetError::Unexpected,

            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -120 => NetError::SocksConnectionFailed,
            -130 => NetError::ProxyConnectionFailed,
            -137 => NetError::NameResolutionFailed,
            -147 => NetError::AddressInUse,

            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -302 => NetError::UnknownUrlScheme,
            -303 => NetError::InvalidRedirect,
            -310 => NetError::TooManyRedirects,
            -320 => NetError::InvalidResponse,
            -321 => NetError::InvalidChunkedEncoding,
            -322 => NetError::MethodNotSupported,
            -324 => NetError::EmptyResponse,
            -325 => NetError::ResponseHeadersTooBig,
            -346 => NetError::ResponseHeadersMultipleContentLength,
            -354 => NetError::ContentLengthMismatch,
            -355 => NetError::IncompleteChunkedEncoding,
            -370 => NetError::InvalidHttpResponse,

            -10000 => NetError::RedirectCycleDetected,
            -10001 => NetError::SocketRemoteClosed,
            -10002 => NetError::InvalidHeader,
            -10003 => NetError::ConflictingFraming,
            -10004 => NetError::UnsupportedProtocol,
            _ => NetError::Unknown(code),
        }
    }
}
