//! DNS resolution, grounded on `src/dns.rs` / `src/dns/gai.rs` /
//! `src/dns/hickory.rs` of the prior art: a `Resolve` trait object with two
//! interchangeable backends, plus the Happy-Eyeballs interleaving rule used
//! by [`crate::route_selector::RouteSelector`] (§4.1 step 4).

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
};

use crate::error::BoxError;

pub type Resolving = Pin<Box<dyn Future<Output = Result<Vec<IpAddr>, BoxError>> + Send>>;

/// A DNS resolver: "resolve one name to a non-empty list, or fail".
///
/// Implementors must not return `Ok(vec![])`; a resolver with no answers
/// should return an error instead so `RouteSelector` treats it the same as
/// any other resolution failure.
pub trait Resolve: Send + Sync {
    fn resolve(&self, host: &str) -> Resolving;

    /// Structural identity used by `AddressKey` equality: two resolvers of
    /// the same concrete type are pool-interchangeable. This crate's
    /// resolvers are stateless backends (`GaiResolver`, `HickoryResolver`),
    /// so "same type" is an equivalent and much cheaper stand-in for
    /// comparing actual resolver configuration.
    fn identity(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The system getaddrinfo resolver, via `tokio::net::lookup_host`. Default
/// backend, with no extra dependency.
#[derive(Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        GaiResolver
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, host: &str) -> Resolving {
        let host = host.to_owned();
        Box::pin(async move {
            // Port is irrelevant to the resolver; lookup_host requires one.
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
            if addrs.is_empty() {
                return Err(format!("no addresses found for {host}").into());
            }
            Ok(addrs.into_iter().map(|a| a.ip()).collect())
        })
    }
}

#[cfg(feature = "hickory-dns")]
pub struct HickoryResolver {
    inner: hickory_resolver::TokioAsyncResolver,
}

#[cfg(feature = "hickory-dns")]
impl HickoryResolver {
    pub fn from_system_conf() -> Result<Self, BoxError> {
        let (cfg, opts) = hickory_resolver::system_conf::read_system_conf()?;
        Ok(HickoryResolver {
            inner: hickory_resolver::TokioAsyncResolver::tokio(cfg, opts),
        })
    }
}

#[cfg(feature = "hickory-dns")]
impl Resolve for HickoryResolver {
    fn resolve(&self, host: &str) -> Resolving {
        let resolver = self.inner.clone();
        let host = host.to_owned();
        Box::pin(async move {
            let lookup = resolver.lookup_ip(host.as_str()).await?;
            let addrs: Vec<IpAddr> = lookup.iter().collect();
            if addrs.is_empty() {
                return Err(format!("no addresses found for {host}").into());
            }
            Ok(addrs)
        })
    }
}

/// Interleave IPv6 and IPv4 addresses: first IPv6, first IPv4, then the
/// remaining addresses in original order. Used only when fast-fallback
/// mode is on (§4.1 step 4); otherwise resolver order is preserved as-is.
pub fn interleave(addrs: Vec<IpAddr>) -> Vec<IpAddr> {
    let first_v6 = addrs.iter().find(|a| a.is_ipv6()).copied();
    let first_v4 = addrs.iter().find(|a| a.is_ipv4()).copied();

    let mut out = Vec::with_capacity(addrs.len());
    out.extend(first_v6);
    out.extend(first_v4);

    // Remaining addresses, in original relative order, skipping only the
    // one occurrence of each already emitted above.
    let mut skipped_v6 = false;
    let mut skipped_v4 = false;
    for addr in addrs {
        if Some(addr) == first_v6 && !skipped_v6 {
            skipped_v6 = true;
            continue;
        }
        if Some(addr) == first_v4 && !skipped_v4 {
            skipped_v4 = true;
            continue;
        }
        out.push(addr);
    }
    out
}

/// Wraps any [`Resolve`] as a cloneable trait object handle.
pub type DynResolver = Arc<dyn Resolve>;
