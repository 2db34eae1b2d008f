//! Enumerates [`Route`] candidates for an [`AddressKey`] (§4.1).

use std::{net::SocketAddr, sync::Arc};

use crate::{
    address::AddressKey,
    dns,
    error::{BoxError, Error},
    proxy::Proxy,
    route::{Route, RouteDB},
};

/// A materialised list of candidate routes for one proxy, produced by
/// [`RouteSelector::next`]. Routes known-bad (per [`RouteDB`]) are appended
/// at the end rather than dropped, so non-failed routes are preferred but
/// failed ones are still retried (§4.1, §8 "Route retry fairness").
pub struct Selection {
    routes: Vec<Route>,
    next: usize,
}

impl Selection {
    pub fn has_next(&self) -> bool {
        self.next < self.routes.len()
    }

    pub fn next(&mut self) -> Option<Route> {
        if self.next < self.routes.len() {
            let r = self.routes[self.next].clone();
            self.next += 1;
            Some(r)
        } else {
            None
        }
    }

    pub fn remaining(&self) -> &[Route] {
        &self.routes[self.next..]
    }
}

/// Produces [`Route`]s by iterating proxies (explicit override, or the
/// address's proxy selector) and their resolved IPs (§4.1).
pub struct RouteSelector {
    address: AddressKey,
    route_db: Arc<RouteDB>,
    fast_fallback: bool,
    proxies: Vec<Proxy>,
    proxy_index: usize,
}

impl RouteSelector {
    pub async fn new(
        address: AddressKey,
        route_db: Arc<RouteDB>,
        fast_fallback: bool,
    ) -> Result<Self, Error> {
        let proxies = Self::candidate_proxies(&address)?;
        Ok(RouteSelector {
            address,
            route_db,
            fast_fallback,
            proxies,
            proxy_index: 0,
        })
    }

    fn candidate_proxies(address: &AddressKey) -> Result<Vec<Proxy>, Error> {
        // Step 1: an explicit override is used alone, no selector call.
        // (Modeled here by the caller passing a selector with exactly one
        // entry when they want an explicit proxy; see `StaticProxySelector`.)
        match &address.proxy_selector {
            Some(selector) => {
                let scheme = if address.is_https() { "https" } else { "http" };
                selector
                    .select(scheme, &address.host)
                    .map_err(Error::planning)
            }
            None => Ok(vec![Proxy::Direct]),
        }
    }

    pub fn has_next(&self) -> bool {
        self.proxy_index < self.proxies.len()
    }

    /// Advance to the next proxy and resolve it, producing a [`Selection`]
    /// of routes. Resolution failure for one proxy is non-fatal (§4.1); the
    /// caller should call `next` again to try the following proxy. If every
    /// proxy in the list fails to resolve, the last error propagates.
    pub async fn next(&mut self) -> Result<Selection, Error> {
        let mut last_err: Option<Error> = None;

        while self.proxy_index < self.proxies.len() {
            let proxy = self.proxies[self.proxy_index].clone();
            self.proxy_index += 1;

            match self.resolve_proxy(&proxy).await {
                Ok(addrs) => {
                    let mut routes: Vec<Route> = Vec::with_capacity(addrs.len());
                    for addr in addrs {
                        let socket_addr = SocketAddr::new(addr, self.peer_port(&proxy));
                        routes.push(Route::new(self.address.clone(), proxy.clone(), socket_addr));
                    }

                    let (fresh, failed): (Vec<_>, Vec<_>) =
                        routes.into_iter().partition(|r| !self.route_db.has_failed(r));

                    let mut ordered = fresh;
                    ordered.extend(failed);

                    return Ok(Selection {
                        routes: ordered,
                        next: 0,
                    });
                }
                Err(e) => {
                    last_err = Some(Error::resolution(e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::planning("no proxies to try")))
    }

    fn peer_port(&self, proxy: &Proxy) -> u16 {
        proxy.port().unwrap_or(self.address.port)
    }

    async fn resolve_proxy(&self, proxy: &Proxy) -> Result<Vec<std::net::IpAddr>, BoxError> {
        let host = match proxy {
            Proxy::Direct => self.address.host.as_ref(),
            Proxy::Http(host, _) | Proxy::Socks(host, _) => host.as_ref(),
        };

        let resolver: Arc<dyn dns::Resolve> = self.address.resolver.clone();
        let addrs = resolver.resolve(host).await?;

        Ok(if self.fast_fallback {
            dns::interleave(addrs)
        } else {
            addrs
        })
    }
}
