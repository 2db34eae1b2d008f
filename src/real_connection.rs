//! A live, reusable transport connection (§3 "RealConnection").

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio::sync::Mutex as AsyncMutex;

use crate::{connect_plan::BoxIo, route::Route};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    Http1_1,
    Http2,
}

/// Handshake metadata retained for diagnostics/event listeners; absent for
/// cleartext connections.
#[derive(Clone, Copy, Debug)]
pub struct Handshake {
    pub negotiated_protocol: NegotiatedProtocol,
    pub tls_spec_index: usize,
}

/// A live, reusable HTTP/1.1 or HTTP/2 transport. Owned by the
/// [`crate::pool::Pool`] once published; calls borrow it through
/// [`crate::pool::Pooled`].
pub struct RealConnection {
    pub route: Route,
    pub negotiated_protocol: NegotiatedProtocol,
    pub handshake: Option<Handshake>,

    io: AsyncMutex<Option<BoxIo>>,

    /// In-flight call count: 0 or 1 for HTTP/1.1, up to `allocation_limit`
    /// for HTTP/2.
    calls: AtomicUsize,
    /// Monotonic: once true, never returns to false (§3 invariant).
    no_new_exchanges: AtomicBool,
    idle_at_nanos: AtomicU32,
    epoch: Instant,
    pub route_failure_count: AtomicU32,
    pub success_count: AtomicU32,
    allocation_limit: AtomicUsize,
    peer_certificate_chain: Vec<Vec<u8>>,
}

impl RealConnection {
    pub fn new(
        route: Route,
        io: BoxIo,
        negotiated_protocol: NegotiatedProtocol,
        handshake: Option<Handshake>,
    ) -> Self {
        Self::with_peer_certificates(route, io, negotiated_protocol, handshake, Vec::new())
    }

    pub fn with_peer_certificates(
        route: Route,
        io: BoxIo,
        negotiated_protocol: NegotiatedProtocol,
        handshake: Option<Handshake>,
        peer_certificate_chain: Vec<Vec<u8>>,
    ) -> Self {
        RealConnection {
            route,
            negotiated_protocol,
            handshake,
            io: AsyncMutex::new(Some(io)),
            calls: AtomicUsize::new(0),
            no_new_exchanges: AtomicBool::new(false),
            idle_at_nanos: AtomicU32::new(0),
            epoch: Instant::now(),
            route_failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            allocation_limit: AtomicUsize::new(1),
            peer_certificate_chain,
        }
    }

    /// DER-encoded leaf-and-chain certificates presented during the TLS
    /// handshake, retained so the pool can re-check coalescing eligibility
    /// (§4.6) for a different hostname without re-handshaking.
    pub fn peer_certificate_chain(&self) -> &[Vec<u8>] {
        &self.peer_certificate_chain
    }

    pub fn is_multiplexed(&self) -> bool {
        self.negotiated_protocol == NegotiatedProtocol::Http2
    }

    pub fn set_allocation_limit(&self, limit: usize) {
        self.allocation_limit.store(limit.max(1), Ordering::SeqCst);
    }

    pub fn allocation_limit(&self) -> usize {
        self.allocation_limit.load(Ordering::SeqCst)
    }

    pub fn in_flight_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        if self.is_multiplexed() {
            self.in_flight_calls() < self.allocation_limit()
        } else {
            self.in_flight_calls() == 0
        }
    }

    /// Attaches one more call. Caller must have already verified capacity
    /// and `no_new_exchanges` under the pool's per-connection lock (§4.6).
    pub fn attach_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Detaches a call. Returns `true` if this was the last call, meaning
    /// the connection is now idle and `idle_at` was just refreshed.
    pub fn detach_call(&self) -> bool {
        let remaining = self.calls.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.idle_at_nanos.store(
                self.epoch.elapsed().as_secs().min(u32::MAX as u64) as u32,
                Ordering::SeqCst,
            );
        }
        remaining == 0
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight_calls() == 0
    }

    pub fn idle_duration(&self) -> std::time::Duration {
        let marked = self.idle_at_nanos.load(Ordering::SeqCst) as u64;
        let now = self.epoch.elapsed().as_secs();
        std::time::Duration::from_secs(now.saturating_sub(marked))
    }

    /// §3 invariant: monotonic, never resets to false.
    pub fn mark_no_new_exchanges(&self) {
        self.no_new_exchanges.store(true, Ordering::SeqCst);
    }

    pub fn no_new_exchanges(&self) -> bool {
        self.no_new_exchanges.load(Ordering::SeqCst)
    }

    /// Cheap health check run *outside* any pool lock (§4.6, §5: "locks are
    /// never held across blocking IO"). `full` distinguishes a weak check
    /// (safe for an idempotent retry, e.g. GET) from a full socket probe.
    pub async fn is_healthy(&self, full: bool) -> bool {
        if self.no_new_exchanges() {
            return false;
        }
        if self.is_multiplexed() {
            // A shutdown HTTP/2 connection has already dropped its socket.
            return self.io.lock().await.is_some();
        }
        if !full {
            return self.idle_duration() < std::time::Duration::from_secs(1) || self.is_idle();
        }
        self.probe_socket_open().await
    }

    async fn probe_socket_open(&self) -> bool {
        self.io.lock().await.is_some()
    }

    /// Takes ownership of the underlying IO object, e.g. to hand off to an
    /// `ExchangeCodec`. Returns `None` if already taken (closed).
    pub async fn take_io(&self) -> Option<BoxIo> {
        self.io.lock().await.take()
    }

    pub async fn put_io_back(&self, io: BoxIo) {
        *self.io.lock().await = Some(io);
    }

    /// Closes the underlying socket, if still present. Idempotent.
    pub async fn close(&self) {
        let taken = self.io.lock().await.take();
        drop(taken);
    }
}

impl std::fmt::Debug for RealConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealConnection")
            .field("route", &self.route)
            .field("protocol", &self.negotiated_protocol)
            .field("calls", &self.in_flight_calls())
            .field("no_new_exchanges", &self.no_new_exchanges())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{address::{AddressKey, Scheme}, dns::GaiResolver, proxy::Proxy};
    use std::sync::Arc as StdArc;

    fn conn() -> RealConnection {
        let address = AddressKey::new(Scheme::Http, "example.com", 80, StdArc::new(GaiResolver::new()));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        RealConnection::new(route, Box::pin(tokio::io::empty()), NegotiatedProtocol::Http1_1, None)
    }

    #[test]
    fn http1_capacity_is_single_slot() {
        let c = conn();
        assert!(c.has_capacity());
        c.attach_call();
        assert!(!c.has_capacity());
    }

    #[test]
    fn no_new_exchanges_is_monotonic() {
        let c = conn();
        assert!(!c.no_new_exchanges());
        c.mark_no_new_exchanges();
        assert!(c.no_new_exchanges());
        // there is no API to unset it; re-marking is a no-op.
        c.mark_no_new_exchanges();
        assert!(c.no_new_exchanges());
    }

    #[test]
    fn detach_reports_last_call() {
        let c = conn();
        c.attach_call();
        c.attach_call();
        assert!(!c.detach_call());
        assert!(c.detach_call());
        assert!(c.is_idle());
    }
}
