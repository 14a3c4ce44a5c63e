//! DNS resolution.
//!
//! Two layers:
//! - Backends implementing [`Resolve`]: the system resolver
//!   ([`GaiResolver`], getaddrinfo on a worker thread), [`HickoryResolver`]
//!   (async, PTR capable) and [`DnsResolverWithOverrides`] for static maps.
//! - [`HostResolver`], which runs a backend off the event loop and hands
//!   the result back to a chosen [`EventLoop`](crate::base::EventLoop)
//!   with race-safe cancellation.
//!
//! # Example
//!
//! ```rust,ignore
//! use netloop::base::EventLoop;
//! use netloop::dns::{HostResolver, ResolveRequest};
//!
//! let event_loop = EventLoop::new()?;
//! let handle = HostResolver::default().resolve(
//!     ResolveRequest::forward_all("example.com", 80),
//!     &event_loop,
//!     |result| println!("{:?}", result),
//! );
//! ```

mod gai;
mod hickory;
mod hostresolver;
mod resolve;

pub use gai::{GaiResolver, SocketAddrs};
pub use hickory::HickoryResolver;
pub use hostresolver::{
    HostResolver, IpPolicy, LookupMode, Resolution, ResolveHandle, ResolveRequest,
    ResolverConfig,
};
pub use resolve::{Addrs, DnsResolverWithOverrides, Name, Resolve, ReverseResolving, Resolving};
