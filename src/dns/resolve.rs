//! Core DNS resolution types and traits.
//!
//! `Resolve` is the backend abstraction: it turns names into addresses and
//! addresses into names. Backends are `Send + Sync` and run off the event
//! loop; [`HostResolver`](super::HostResolver) hands their results back to
//! a loop.

use crate::base::neterror::NetError;
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
};

/// A domain name to resolve into IP addresses.
///
/// This is a lightweight wrapper around a hostname string that provides
/// a type-safe way to pass domain names to resolvers.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from any string-like type.
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a forward lookup.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Alias for the `Future` type returned by a reverse lookup.
pub type ReverseResolving = Pin<Box<dyn Future<Output = Result<Name, NetError>> + Send>>;

/// Trait for DNS resolution backends.
///
/// Implementations must be thread-safe: lookups run on the runtime or on
/// worker threads, never on the event loop's own task set.
pub trait Resolve: Send + Sync {
    /// Resolves a domain name to IP addresses.
    ///
    /// The returned addresses will have port 0; callers should set the
    /// appropriate port based on the target service.
    fn resolve(&self, name: Name) -> Resolving;

    /// Resolves an address back to a host name.
    ///
    /// The default implementation reports the address as unresolvable.
    fn resolve_reverse(&self, addr: IpAddr) -> ReverseResolving {
        Box::pin(std::future::ready(Err(NetError::dns_failed(
            &addr.to_string(),
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "reverse lookup not supported by this resolver",
            ),
        ))))
    }
}

/// Blanket implementation for Arc-wrapped resolvers.
impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }

    fn resolve_reverse(&self, addr: IpAddr) -> ReverseResolving {
        (**self).resolve_reverse(addr)
    }
}

/// DNS resolver wrapper that supports hostname overrides.
///
/// Forward lookups consult the override table first; reverse lookups return
/// the first overridden name carrying the address before asking the inner
/// resolver. Handy for tests that must not touch real DNS.
///
/// # Example
///
/// ```rust,ignore
/// use netloop::dns::{DnsResolverWithOverrides, HickoryResolver, Name};
/// use std::collections::HashMap;
/// use std::net::SocketAddr;
///
/// let mut overrides = HashMap::new();
/// overrides.insert(
///     "api.local".into(),
///     vec!["127.0.0.1:0".parse().unwrap()],
/// );
///
/// let resolver = DnsResolverWithOverrides::new(
///     Arc::new(HickoryResolver::new()),
///     overrides,
/// );
/// ```
pub struct DnsResolverWithOverrides {
    inner: Arc<dyn Resolve>,
    overrides: Arc<HashMap<Cow<'static, str>, Vec<SocketAddr>>>,
}

impl DnsResolverWithOverrides {
    /// Creates a new resolver with the given overrides.
    ///
    /// # Arguments
    ///
    /// * `inner` - The fallback resolver for non-overridden hostnames.
    /// * `overrides` - Map of hostnames to their resolved addresses.
    pub fn new(
        inner: Arc<dyn Resolve>,
        overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,
    ) -> Self {
        Self {
            inner,
            overrides: Arc::new(overrides),
        }
    }

    /// Returns the number of configured overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl Resolve for DnsResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        // Check overrides first
        if let Some(addrs) = self.overrides.get(name.as_str()) {
            let addrs: Addrs = Box::new(addrs.clone().into_iter());
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        // Fall back to inner resolver
        self.inner.resolve(name)
    }

    fn resolve_reverse(&self, addr: IpAddr) -> ReverseResolving {
        let hit = self
            .overrides
            .iter()
            .filter(|(_, addrs)| addrs.iter().any(|a| a.ip() == addr))
            .map(|(name, _)| name.as_ref())
            .min();
        if let Some(name) = hit {
            return Box::pin(std::future::ready(Ok(Name::new(name))));
        }
        self.inner.resolve_reverse(addr)
    }
}

impl fmt::Debug for DnsResolverWithOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolverWithOverrides")
            .field("override_count", &self.overrides.len())
            .finish_non_exhaustive()
    }
}
