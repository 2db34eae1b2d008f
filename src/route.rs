use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Mutex,
};

use crate::{address::AddressKey, proxy::Proxy};

/// A concrete (address, proxy, resolved peer) triple one [`crate::connect_plan::ConnectPlan`]
/// attempts.
#[derive(Clone)]
pub struct Route {
    pub address: AddressKey,
    pub proxy: Proxy,
    pub socket_addr: SocketAddr,
}

impl Route {
    pub fn new(address: AddressKey, proxy: Proxy, socket_addr: SocketAddr) -> Self {
        Route {
            address,
            proxy,
            socket_addr,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Route({} via {} -> {})",
            self.address.host, self.proxy, self.socket_addr
        )
    }
}

/// Identity used to key a [`Route`] into [`RouteDB`]: proxy + resolved peer.
/// The `AddressKey` itself is deliberately excluded — a route failing for
/// one address is a reasonable signal the same peer is bad for sibling
/// calls sharing a resolver, which is how the source's `RouteDatabase`
/// behaves (it is keyed on `Route`, whose equality ignores most of
/// `Address` beyond what produced the route).
#[derive(Clone, PartialEq, Eq, Hash)]
struct RouteId {
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl From<&Route> for RouteId {
    fn from(r: &Route) -> Self {
        RouteId {
            proxy: r.proxy.clone(),
            socket_addr: r.socket_addr,
        }
    }
}

/// Set of recently failed routes, consulted by [`crate::route_selector::RouteSelector`]
/// to push known-bad routes to the end of a `Selection` (§4.1) rather than
/// dropping them.
#[derive(Default)]
pub struct RouteDB {
    failed: Mutex<HashSet<RouteId>>,
}

impl RouteDB {
    pub fn new() -> Self {
        RouteDB::default()
    }

    pub fn mark_failed(&self, route: &Route) {
        self.failed.lock().unwrap().insert(RouteId::from(route));
    }

    pub fn mark_succeeded(&self, route: &Route) {
        self.failed.lock().unwrap().remove(&RouteId::from(route));
    }

    pub fn has_failed(&self, route: &Route) -> bool {
        self.failed.lock().unwrap().contains(&RouteId::from(route))
    }
}
