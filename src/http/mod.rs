//! HTTP/1.x client engine.
//!
//! - [`HttpConn`]: one request/response exchange, redirects included
//! - [`ResponseDecoder`]: sans-IO response parser
//! - [`RequestHeaders`] and [`HeaderFlags`]: request header list with validation

pub mod decoder;
pub mod event;
pub mod httpconn;
pub mod orderedheaders;
pub mod requestbody;
pub mod response;

// Re-exports for convenience
pub use decoder::{DecodeEvent, Framing, ResponseDecoder};
pub use event::{DataProgress, HttpEvent, RedirectInfo};
pub use httpconn::HttpConn;
pub use orderedheaders::{HeaderFlags, RequestHeaders};
pub use requestbody::RequestBody;
pub use response::{HttpResponse, ResponseHead};
