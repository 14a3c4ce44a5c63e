//! Sockets and connections.
//!
//! - [`conn`]: event-driven TCP connection with buffered reads and writes
//! - [`proxy`]: plain HTTP proxy settings

pub mod conn;
pub mod proxy;
mod readqueue;
mod writequeue;

pub use conn::{Conn, ConnEvent, ConnState};
pub use proxy::{ProxyBuilder, ProxySettings};
pub use writequeue::WriteId;
