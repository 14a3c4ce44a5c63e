//! Async DNS resolver using hickory-dns.
//!
//! Fully async forward and PTR lookups, configured from the system's
//! resolv.conf when available. Each `HickoryResolver` owns its own
//! hickory instance: name-server connections are spawned on whichever
//! runtime first uses them, and every `EventLoop` is its own runtime.

use super::{Addrs, Name, Resolve, ReverseResolving, Resolving};
use crate::base::neterror::NetError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

/// Per-query timeout. Kept short so a PTR query against an unreachable
/// name server falls back quickly.
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Async DNS resolver backed by hickory-dns.
///
/// ```rust,ignore
/// use netloop::dns::{HickoryResolver, Name, Resolve};
///
/// let resolver = HickoryResolver::new();
/// let addrs = resolver.resolve(Name::new("example.com")).await?;
/// ```
#[derive(Debug, Clone)]
pub struct HickoryResolver {
    resolver: Arc<TokioResolver>,
}

impl HickoryResolver {
    /// Creates a new `HickoryResolver`.
    ///
    /// Reads the system DNS configuration; if that fails, falls back to
    /// hickory's defaults.
    pub fn new() -> Self {
        let mut builder = match TokioResolver::builder_tokio() {
            Ok(builder) => {
                tracing::debug!("Using system DNS configuration");
                builder
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to read system DNS config, using defaults"
                );
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
            }
        };

        let options = builder.options_mut();
        options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        options.timeout = QUERY_TIMEOUT;
        options.attempts = 1;

        Self {
            resolver: Arc::new(builder.build()),
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(domain: &str, detail: impl ToString) -> NetError {
    NetError::dns_failed(
        domain,
        std::io::Error::new(std::io::ErrorKind::NotFound, detail.to_string()),
    )
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let domain = name.as_str();
            tracing::debug!(domain = %domain, "resolving via hickory-dns");

            let lookup = resolver.lookup_ip(domain).await.map_err(|e| {
                tracing::debug!(domain = %domain, error = %e, "hickory-dns lookup failed");
                not_found(domain, e)
            })?;

            let addrs: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, 0)).collect();

            if addrs.is_empty() {
                return Err(not_found(domain, "No addresses returned"));
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "hickory-dns resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }

    fn resolve_reverse(&self, addr: IpAddr) -> ReverseResolving {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let text = addr.to_string();
            tracing::debug!(addr = %text, "reverse lookup via hickory-dns");

            let lookup = resolver.reverse_lookup(addr).await.map_err(|e| {
                tracing::debug!(addr = %text, error = %e, "PTR lookup failed");
                not_found(&text, e)
            })?;

            let name = lookup
                .iter()
                .next()
                .map(|ptr| ptr.to_string())
                .ok_or_else(|| not_found(&text, "No PTR records returned"))?;

            Ok(Name::new(name.trim_end_matches('.')))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hickory_resolver_known_domain() {
        let resolver = HickoryResolver::new();
        let result = resolver.resolve(Name::new("localhost")).await;

        // localhost should resolve on any system
        assert!(result.is_ok());
        let addrs: Vec<_> = result.unwrap().collect();
        assert!(!addrs.is_empty());
    }

    #[tokio::test]
    async fn test_hickory_resolver_invalid_domain() {
        let resolver = HickoryResolver::new();
        let result = resolver
            .resolve(Name::new("this-domain-definitely-does-not-exist.invalid"))
            .await;

        match result {
            Err(NetError::NameNotResolvedFor { domain, .. }) => {
                assert_eq!(domain, "this-domain-definitely-does-not-exist.invalid");
            }
            Err(other) => panic!("Unexpected error type: {other:?}"),
            Ok(_) => panic!("Should have error"),
        }
    }

    #[test]
    fn test_hickory_resolver_clone_shares_instance() {
        let r1 = HickoryResolver::new();
        let r2 = r1.clone();
        assert!(Arc::ptr_eq(&r1.resolver, &r2.resolver));
    }
}
