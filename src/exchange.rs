//! The boundary this crate hands off to an HTTP exchange codec (§4.7).
//!
//! Everything past "bytes flow over this connection" — request/response
//! framing, HTTP/2 stream multiplexing, body codecs — is out of scope
//! (§1 Non-goals). `Carrier` is the seam: whatever drives the wire protocol
//! on a [`RealConnection`] reports back through it so the pool and planner
//! stay consistent with what actually happened on the socket.

use std::sync::Arc;

use crate::{error::Error, pool::Pooled, real_connection::RealConnection, route::Route};

/// Implemented by whatever owns a checked-out connection while it is
/// driving exchanges over it. A pooled HTTP/1.1 connection or an HTTP/2
/// session both implement this the same way: by delegating to the
/// [`Pooled`] guard and the originating [`crate::route_planner::RoutePlanner`].
pub trait Carrier: Send + Sync {
    /// The route this carrier's connection was established on.
    fn route(&self) -> &Route;

    /// The live connection backing this carrier.
    fn connection(&self) -> &Arc<RealConnection>;

    /// Marks the connection as not accepting further exchanges (§3
    /// invariant: monotonic). Called once a `Connection: close` response is
    /// seen, or a protocol error makes continued use unsafe.
    fn no_new_exchanges(&self);

    /// Aborts whatever exchange is in flight and releases the connection
    /// without marking it unhealthy, e.g. on a caller-initiated timeout.
    fn cancel(&self);

    /// Reports a failed exchange attempt on this carrier's connection. Used
    /// by a caller to decide, via its [`crate::route_planner::RoutePlanner`],
    /// whether a queued-retry route should be tried transparently on the
    /// next connect (§4.2).
    fn track_failure(&self, error: &Error);
}

/// A straightforward [`Carrier`] over one [`Pooled`] connection: the common
/// case for both HTTP/1.1 request/response pairs and, once established, an
/// HTTP/2 session's individual streams.
pub struct PooledCarrier {
    pooled: Pooled,
}

impl PooledCarrier {
    pub fn new(pooled: Pooled) -> Self {
        PooledCarrier { pooled }
    }

    pub fn into_pooled(self) -> Pooled {
        self.pooled
    }
}

impl Carrier for PooledCarrier {
    fn route(&self) -> &Route {
        &self.pooled.connection().route
    }

    fn connection(&self) -> &Arc<RealConnection> {
        self.pooled.connection()
    }

    fn no_new_exchanges(&self) {
        self.pooled.connection().mark_no_new_exchanges();
    }

    fn cancel(&self) {
        self.pooled.connection().mark_no_new_exchanges();
    }

    fn track_failure(&self, error: &Error) {
        if error.is_connect() || error.is_tls() {
            // Connect-time failures are the planner's concern, not an
            // in-flight exchange's; nothing to record here.
            return;
        }
        log::debug!(
            "exchange failure on connection to {}: {error}",
            self.route().address.host
        );
        // A mid-exchange failure that isn't a connect/TLS issue means the
        // socket was already live and broke: don't offer it to another call.
        self.pooled.connection().mark_no_new_exchanges();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{AddressKey, Scheme},
        dns::GaiResolver,
        pool::{Config, Pool},
        proxy::Proxy,
        real_connection::NegotiatedProtocol,
    };
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn no_new_exchanges_propagates_to_the_connection() {
        let address = AddressKey::new(Scheme::Http, "example.com", 80, StdArc::new(GaiResolver::new()));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        let conn = StdArc::new(RealConnection::new(
            route,
            Box::pin(tokio::io::empty()),
            NegotiatedProtocol::Http1_1,
            None,
        ));
        let pool = Pool::new(Config::default());
        let pooled = pool.insert(conn);
        let carrier = PooledCarrier::new(pooled);

        assert!(!carrier.connection().no_new_exchanges());
        carrier.no_new_exchanges();
        assert!(carrier.connection().no_new_exchanges());
    }

    #[tokio::test]
    async fn track_failure_retires_the_connection_on_mid_exchange_errors() {
        let address = AddressKey::new(Scheme::Http, "example.com", 80, StdArc::new(GaiResolver::new()));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        let conn = StdArc::new(RealConnection::new(
            route,
            Box::pin(tokio::io::empty()),
            NegotiatedProtocol::Http1_1,
            None,
        ));
        let pool = Pool::new(Config::default());
        let pooled = pool.insert(conn);
        let carrier = PooledCarrier::new(pooled);

        carrier.track_failure(&Error::tunnel("peer reset the stream"));
        assert!(carrier.connection().no_new_exchanges());
    }

    #[tokio::test]
    async fn track_failure_ignores_connect_and_tls_errors() {
        let address = AddressKey::new(Scheme::Http, "example.com", 80, StdArc::new(GaiResolver::new()));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        let conn = StdArc::new(RealConnection::new(
            route,
            Box::pin(tokio::io::empty()),
            NegotiatedProtocol::Http1_1,
            None,
        ));
        let pool = Pool::new(Config::default());
        let pooled = pool.insert(conn);
        let carrier = PooledCarrier::new(pooled);

        carrier.track_failure(&Error::tcp_connect("refused"));
        assert!(!carrier.connection().no_new_exchanges());
    }
}
