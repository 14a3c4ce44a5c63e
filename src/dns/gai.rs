//! System DNS resolver using getaddrinfo.
//!
//! Forward lookups call the operating system's `getaddrinfo` on a blocking
//! worker thread, so `/etc/hosts`, nsswitch and resolv.conf are honoured.
//! The standard library has no `getnameinfo` counterpart, so reverse lookups
//! are delegated to a hickory PTR query. The hickory instance is built on
//! first use and kept, so its name-server connections belong to the event
//! loop that ran the first reverse lookup.

use super::hickory::HickoryResolver;
use super::hostresolver::IpPolicy;
use super::{Addrs, Name, Resolve, ReverseResolving, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
    sync::{Arc, OnceLock},
};

/// System DNS resolver using `getaddrinfo` in a thread pool.
///
/// Each lookup occupies one blocking worker thread for its duration.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver {
    // Built on the first reverse lookup and shared by clones.
    reverse: Arc<OnceLock<HickoryResolver>>,
}

impl GaiResolver {
    /// Creates a new `GaiResolver`.
    pub fn new() -> Self {
        Self::default()
    }

    fn reverse_resolver(&self) -> &HickoryResolver {
        self.reverse.get_or_init(HickoryResolver::new)
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let domain = host.clone();

            let result = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            // Join errors mean the worker panicked or the runtime is shutting down
            let addrs = result
                .map_err(|e| {
                    tracing::error!(error = %e, "DNS resolution task failed");
                    NetError::NameNotResolved
                })?
                .map_err(|e| {
                    tracing::debug!(domain = %domain, error = %e, "DNS resolution failed");
                    e
                })
                .dns_context(&domain)?;

            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "No addresses returned by getaddrinfo",
                ))
                .dns_context(&domain);
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "DNS resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }

    fn resolve_reverse(&self, addr: IpAddr) -> ReverseResolving {
        self.reverse_resolver().resolve_reverse(addr)
    }
}

/// Utility for parsing IP address strings directly.
///
/// Bypasses DNS resolution if the host is already an IP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddrs {
    addrs: Vec<SocketAddr>,
}

impl SocketAddrs {
    /// Creates a new `SocketAddrs` from a vector.
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }

    /// Attempts to parse a host string as an IP address.
    ///
    /// Accepts bracketed IPv6 literals as they appear in URLs. Returns
    /// `None` for anything that needs a real lookup.
    pub fn try_parse(host: &str, port: u16) -> Option<Self> {
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Some(Self {
                addrs: vec![SocketAddr::V4(SocketAddrV4::new(addr, port))],
            });
        }

        let unbracketed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(addr) = unbracketed.parse::<Ipv6Addr>() {
            return Some(Self {
                addrs: vec![SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))],
            });
        }

        None
    }

    /// Returns true if no addresses are available.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Returns the number of addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Rewrites every address to use `port`.
    pub fn with_port(mut self, port: u16) -> Self {
        for addr in &mut self.addrs {
            addr.set_port(port);
        }
        self
    }

    /// Orders and filters addresses by address-family policy.
    ///
    /// The relative order within each family is preserved.
    pub fn order_by_policy(self, policy: IpPolicy) -> Self {
        let (v4, v6): (Vec<_>, Vec<_>) = self.addrs.into_iter().partition(|a| a.is_ipv4());
        let addrs = match policy {
            IpPolicy::Ipv4ThenIpv6 => v4.into_iter().chain(v6).collect(),
            IpPolicy::Ipv6ThenIpv4 => v6.into_iter().chain(v4).collect(),
            IpPolicy::Ipv4Only => v4,
            IpPolicy::Ipv6Only => v6,
        };
        Self { addrs }
    }

    pub fn into_vec(self) -> Vec<SocketAddr> {
        self.addrs
    }
}

impl Iterator for SocketAddrs {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.addrs.is_empty() {
            None
        } else {
            Some(self.addrs.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_socket_addrs_try_parse_ipv4() {
        let result = SocketAddrs::try_parse("127.0.0.1", 8080);
        assert!(result.is_some());

        let addrs = result.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(
            addrs.addrs[0],
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080)
        );
    }

    #[test]
    fn test_socket_addrs_try_parse_ipv6() {
        let addrs = SocketAddrs::try_parse("::1", 443).unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs.addrs[0].is_ipv6());

        let bracketed = SocketAddrs::try_parse("[::1]", 443).unwrap();
        assert_eq!(bracketed, addrs);
    }

    #[test]
    fn test_socket_addrs_try_parse_hostname() {
        assert!(SocketAddrs::try_parse("example.com", 80).is_none());
        assert!(SocketAddrs::try_parse("[example.com]", 80).is_none());
    }

    fn mixed() -> SocketAddrs {
        SocketAddrs::new(vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 0),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)), 0),
        ])
    }

    #[test]
    fn test_order_by_policy_ipv4_first() {
        let ordered = mixed().order_by_policy(IpPolicy::Ipv4ThenIpv6).into_vec();
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].ip(), IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(ordered[1].ip(), IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)));
        assert!(ordered[2].is_ipv6());
    }

    #[test]
    fn test_order_by_policy_filters() {
        let v6 = mixed().order_by_policy(IpPolicy::Ipv6Only);
        assert_eq!(v6.len(), 1);

        let v4 = mixed().order_by_policy(IpPolicy::Ipv4Only).into_vec();
        assert!(v4.iter().all(|a| a.is_ipv4()));
        assert_eq!(v4.len(), 2);
    }

    #[test]
    fn test_with_port() {
        let addrs = mixed().with_port(8080).into_vec();
        assert!(addrs.iter().all(|a| a.port() == 8080));
    }

    #[test]
    fn test_reverse_resolver_built_once() {
        let resolver = GaiResolver::new();
        let clone = resolver.clone();
        assert!(resolver.reverse.get().is_none());

        let first: *const HickoryResolver = resolver.reverse_resolver();
        let second: *const HickoryResolver = clone.reverse_resolver();
        assert!(std::ptr::eq(first, second));
    }

    #[tokio::test]
    async fn test_gai_resolver_unknown_name_carries_domain() {
        let resolver = GaiResolver::new();
        match resolver.resolve(Name::new("no-such-host.invalid")).await {
            Err(NetError::NameNotResolvedFor { domain, .. }) => {
                assert_eq!(domain, "no-such-host.invalid")
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => {}
        }
    }

    #[tokio::test]
    async fn test_gai_resolver_localhost() {
        let resolver = GaiResolver::new();
        let result = resolver.resolve(Name::new("localhost")).await;

        // localhost should always resolve
        assert!(result.is_ok());
        let addrs: Vec<_> = result.unwrap().collect();
        assert!(!addrs.is_empty());
    }
}
