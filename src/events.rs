//! Observability hooks, carried as ambient stack alongside the connection
//! lifecycle even though the distilled spec scopes metrics/tracing out
//! (SPEC_FULL.md §4.10): a no-op-by-default trait callers can implement to
//! watch DNS, proxy, connect, and pool events without this crate depending
//! on any particular metrics backend.

use std::{net::IpAddr, sync::Arc, time::Duration};

use crate::{proxy::Proxy, route::Route};

/// Implementors receive best-effort notifications of connection-acquisition
/// lifecycle events. All methods have no-op defaults; implement only the
/// ones you care about. Calls happen on whatever task triggered the event —
/// an implementation that blocks will stall that task.
pub trait EventListener: Send + Sync {
    fn dns_start(&self, _host: &str) {}
    fn dns_end(&self, _host: &str, _addrs: &[IpAddr]) {}
    fn dns_failed(&self, _host: &str, _error: &str) {}

    fn proxy_selected(&self, _host: &str, _proxy: &Proxy) {}

    fn connect_start(&self, _route: &Route) {}
    fn connect_end(&self, _route: &Route, _duration: Duration) {}
    fn connect_failed(&self, _route: &Route, _error: &str) {}

    fn secure_connect_start(&self, _route: &Route) {}
    fn secure_connect_end(&self, _route: &Route, _duration: Duration) {}

    fn connection_acquired(&self, _route: &Route) {}
    fn connection_released(&self, _route: &Route) {}
    fn connection_closed(&self, _route: &Route) {}
}

/// The default listener used when a caller configures none: every hook is a
/// no-op.
#[derive(Default, Clone, Copy)]
pub struct NoOpListener;

impl EventListener for NoOpListener {}

/// Forwards every event to the `log` facade at debug level. Useful as a
/// drop-in listener during development without writing a custom one.
#[derive(Default, Clone, Copy)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn dns_start(&self, host: &str) {
        log::debug!("dns_start host={host}");
    }

    fn dns_end(&self, host: &str, addrs: &[IpAddr]) {
        log::debug!("dns_end host={host} addrs={addrs:?}");
    }

    fn dns_failed(&self, host: &str, error: &str) {
        log::debug!("dns_failed host={host} error={error}");
    }

    fn proxy_selected(&self, host: &str, proxy: &Proxy) {
        log::debug!("proxy_selected host={host} proxy={proxy}");
    }

    fn connect_start(&self, route: &Route) {
        log::debug!("connect_start route={route:?}");
    }

    fn connect_end(&self, route: &Route, duration: Duration) {
        log::debug!("connect_end route={route:?} duration={duration:?}");
    }

    fn connect_failed(&self, route: &Route, error: &str) {
        log::debug!("connect_failed route={route:?} error={error}");
    }

    fn secure_connect_start(&self, route: &Route) {
        log::debug!("secure_connect_start route={route:?}");
    }

    fn secure_connect_end(&self, route: &Route, duration: Duration) {
        log::debug!("secure_connect_end route={route:?} duration={duration:?}");
    }

    fn connection_acquired(&self, route: &Route) {
        log::debug!("connection_acquired route={route:?}");
    }

    fn connection_released(&self, route: &Route) {
        log::debug!("connection_released route={route:?}");
    }

    fn connection_closed(&self, route: &Route) {
        log::debug!("connection_closed route={route:?}");
    }
}

pub(crate) type SharedListener = Arc<dyn EventListener>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listener_is_inert() {
        let listener = NoOpListener;
        listener.dns_start("example.com");
        listener.connect_failed(
            &Route::new(
                crate::address::AddressKey::new(
                    crate::address::Scheme::Http,
                    "example.com",
                    80,
                    Arc::new(crate::dns::GaiResolver::new()),
                ),
                Proxy::Direct,
                "127.0.0.1:80".parse().unwrap(),
            ),
            "boom",
        );
    }
}
