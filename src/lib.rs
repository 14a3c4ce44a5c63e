//! # netloop
//!
//! Event-driven TCP connections and an HTTP/1.x client for programs that
//! run a single-threaded event loop.
//!
//! Everything schedules on an [`EventLoop`](base::EventLoop): resolution
//! results, socket readiness and timers all come back as callbacks while
//! the owning thread iterates that loop. Blocking name lookups run on
//! worker threads and are handed back to the loop before they touch any
//! connection state.
//!
//! ## Layers
//!
//! - [`dns::HostResolver`]: cancellable forward and reverse lookups
//! - [`socket::Conn`]: one TCP connection as an ordered event stream
//! - [`http::HttpConn`]: HTTP request/response over `Conn`, with chunked
//!   bodies, `100 Continue` and redirects
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netloop::base::EventLoop;
//! use netloop::http::{HttpConn, HttpEvent};
//!
//! let event_loop = EventLoop::new()?;
//! let conn = HttpConn::new(&event_loop);
//! conn.set_uri("http://example.com/")?;
//! conn.set_callback(|_, event| {
//!     if let HttpEvent::DataPartial(progress) = event {
//!         println!("{} bytes so far", progress.received);
//!     }
//! });
//! conn.run()?;
//! println!("Status: {:?}", conn.response().map(|r| r.status()));
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Event loop, error codes and load states
//! - [`dns`] - Resolver backends and the loop-facing resolver
//! - [`socket`] - Event-driven connections and proxy settings
//! - [`http`] - Request building, response decoding, the exchange engine
//! - [`client`] - Configuration and one-call helpers

pub mod base;
pub mod client;
pub mod dns;
pub mod http;
pub mod socket;

pub use base::{EventLoop, NetError};
pub use client::{http_get, HttpConfig};
pub use http::{HttpConn, HttpEvent, HttpResponse};
pub use socket::{Conn, ConnEvent};
