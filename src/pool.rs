//! Concurrent pool of [`RealConnection`]s: acquire/release/evict, health
//! checks, coalescing, and leak detection (§4.6).

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use crate::{address::AddressKey, real_connection::RealConnection, route::Route};

#[derive(Clone, Debug)]
pub struct Config {
    pub max_idle_connections: usize,
    pub keep_alive: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

struct PoolInner {
    config: Config,
    connections: Mutex<Vec<Arc<RealConnection>>>,
    maintenance_scheduled: AtomicBool,
}

/// A concurrent set of connections shared across calls to the same or
/// coalescible addresses. Not a singleton — applications that want a
/// shared pool pass the same `Pool` instance to every caller.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(config: Config) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                connections: Mutex::new(Vec::new()),
                maintenance_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.max_idle_connections > 0
    }

    /// §4.6 acquire: returns a connection eligible for `address`, either by
    /// exact match or HTTP/2 coalescing against `routes` (when given). The
    /// health check always runs outside the connections-list lock.
    pub async fn acquire_pooled(
        &self,
        address: &AddressKey,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
        full_health_check: bool,
    ) -> Option<Pooled> {
        loop {
            let candidate = {
                let conns = self.inner.connections.lock().unwrap();
                conns
                    .iter()
                    .find(|c| {
                        c.is_multiplexed() == require_multiplexed
                            && !c.no_new_exchanges()
                            && c.has_capacity()
                            && is_eligible(c, address, routes)
                    })
                    .cloned()
            };

            let Some(candidate) = candidate else {
                return None;
            };

            candidate.attach_call();

            // Health check runs outside the list lock (§4.6, §5).
            if candidate.is_healthy(full_health_check).await {
                log::debug!("pool acquire hit for {}", address.host);
                return Some(Pooled::new(candidate, Arc::downgrade(&self.inner)));
            }

            candidate.detach_call();
            candidate.mark_no_new_exchanges();
            self.remove(&candidate);
            // keep scanning: another connection may still be eligible.
        }
    }

    /// Publishes a freshly connected `RealConnection`, attaching the
    /// caller's call in the same step (matches the source's "insert and
    /// immediately hand to the waiting call" behavior).
    pub fn insert(&self, connection: Arc<RealConnection>) -> Pooled {
        connection.attach_call();
        self.inner.connections.lock().unwrap().push(connection.clone());
        self.schedule_maintenance();
        Pooled::new(connection, Arc::downgrade(&self.inner))
    }

    fn remove(&self, connection: &Arc<RealConnection>) {
        self.inner
            .connections
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, connection));
    }

    fn on_release(&self, connection: &Arc<RealConnection>) {
        let was_last = connection.detach_call();
        if !was_last {
            return;
        }

        if connection.no_new_exchanges() || self.inner.config.max_idle_connections == 0 {
            self.remove(connection);
            let connection = connection.clone();
            tokio::spawn(async move { connection.close().await });
        } else {
            self.schedule_maintenance();
        }
    }

    /// §4.6 `evictAll`: idle connections close immediately; in-use ones are
    /// marked `no_new_exchanges` and close once their last call releases.
    pub fn evict_all(&self) {
        let (idle, marked): (Vec<_>, Vec<_>) = {
            let conns = self.inner.connections.lock().unwrap();
            conns.iter().cloned().partition(|c| c.is_idle())
        };

        self.inner
            .connections
            .lock()
            .unwrap()
            .retain(|c| !idle.iter().any(|i| Arc::ptr_eq(i, c)));

        for c in idle {
            tokio::spawn(async move { c.close().await });
        }
        for c in marked {
            c.mark_no_new_exchanges();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_maintenance(&self) {
        if self
            .inner
            .maintenance_scheduled
            .swap(true, Ordering::SeqCst)
        {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match sweep(&inner) {
                    SweepOutcome::Stop => {
                        inner.maintenance_scheduled.store(false, Ordering::SeqCst);
                        return;
                    }
                    SweepOutcome::RunAgain(evicted) => {
                        if let Some(evicted) = evicted {
                            tokio::spawn(async move { evicted.close().await });
                        }
                        continue;
                    }
                    SweepOutcome::SleepFor(duration) => {
                        tokio::time::sleep(duration).await;
                    }
                }
            }
        });
    }
}

enum SweepOutcome {
    Stop,
    RunAgain(Option<Arc<RealConnection>>),
    SleepFor(Duration),
}

/// §4.6 maintenance sweep: evicts the longest-idle connection if it
/// exceeds the keep-alive window or the idle count is over the cap;
/// otherwise reports how long until the next check is worth doing.
fn sweep(inner: &PoolInner) -> SweepOutcome {
    let mut conns = inner.connections.lock().unwrap();
    if conns.is_empty() {
        return SweepOutcome::Stop;
    }

    let idle: Vec<Arc<RealConnection>> = conns.iter().filter(|c| c.is_idle()).cloned().collect();
    if idle.is_empty() {
        return SweepOutcome::SleepFor(inner.config.keep_alive);
    }

    let longest = idle
        .iter()
        .max_by_key(|c| c.idle_duration())
        .cloned()
        .expect("idle is non-empty");

    if longest.idle_duration() >= inner.config.keep_alive || idle.len() > inner.config.max_idle_connections
    {
        conns.retain(|c| !Arc::ptr_eq(c, &longest));
        log::debug!(
            "evicting idle connection to {} (idle {:?})",
            longest.route.address.host,
            longest.idle_duration()
        );
        return SweepOutcome::RunAgain(Some(longest));
    }

    SweepOutcome::SleepFor(inner.config.keep_alive - longest.idle_duration())
}

/// §4.6 eligibility: exact address match, or HTTP/2 coalescing.
fn is_eligible(conn: &RealConnection, address: &AddressKey, routes: Option<&[Route]>) -> bool {
    if conn.route.address == *address {
        return true;
    }

    if !conn.is_multiplexed() {
        return false;
    }
    if !conn.route.address.equal_ignoring_host(address) {
        return false;
    }

    let Some(routes) = routes else {
        return false;
    };
    let shares_ip = routes.iter().any(|r| r.socket_addr == conn.route.socket_addr);
    if !shares_ip {
        return false;
    }

    let Some(tls) = address.tls.as_ref() else {
        return false;
    };
    let Some(pinner) = tls.pinner.as_ref() else {
        // No certificate authority configured for this address: coalescing
        // would silently trust a connection's cert for a hostname nobody
        // validated it against. Refuse rather than guess.
        return false;
    };
    let chain = conn.peer_certificate_chain();
    pinner.check(&address.host, chain).is_ok()
}

/// Per-call RAII handle to an acquired [`RealConnection`]. Dropping it
/// without calling [`Pooled::release`] first is treated as a leaked call
/// (§5 "weak back-references for leak detection", adapted to Rust's
/// ownership model: there is no GC to silently collect a forgotten handle,
/// so instead the crate distinguishes a graceful release from an implicit
/// one and logs the latter).
pub struct Pooled {
    connection: Arc<RealConnection>,
    pool: Weak<PoolInner>,
    released: bool,
}

impl Pooled {
    fn new(connection: Arc<RealConnection>, pool: Weak<PoolInner>) -> Self {
        Pooled {
            connection,
            pool,
            released: false,
        }
    }

    pub fn connection(&self) -> &Arc<RealConnection> {
        &self.connection
    }

    /// Explicitly releases the connection back to the pool. Equivalent to
    /// dropping the handle, but does not log a leak warning.
    pub fn release(mut self) {
        self.released = true;
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        if !self.released {
            log::warn!(
                "connection to {} released implicitly (response body not consumed/closed?)",
                self.connection.route.address.host
            );
        }

        if let Some(inner) = self.pool.upgrade() {
            Pool { inner }.on_release(&self.connection);
        } else {
            self.connection.detach_call();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{address::Scheme, dns::GaiResolver, proxy::Proxy, real_connection::NegotiatedProtocol};
    use std::sync::Arc as StdArc;

    fn make_connection(host: &str) -> Arc<RealConnection> {
        let address = AddressKey::new(Scheme::Http, host, 80, StdArc::new(GaiResolver::new()));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        Arc::new(RealConnection::new(
            route,
            Box::pin(tokio::io::empty()),
            NegotiatedProtocol::Http1_1,
            None,
        ))
    }

    #[tokio::test]
    async fn acquire_then_release_frees_capacity() {
        let pool = Pool::new(Config::default());
        let conn = make_connection("example.com");
        let address = conn.route.address.clone();
        let pooled = pool.insert(conn);
        assert!(!pooled.connection().has_capacity());
        pooled.release();

        let reacquired = pool.acquire_pooled(&address, None, false, false).await;
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn http1_connection_with_no_capacity_is_not_reused() {
        let pool = Pool::new(Config::default());
        let conn = make_connection("example.com");
        let address = conn.route.address.clone();
        let _pooled = pool.insert(conn); // capacity now exhausted, handle kept alive

        let reacquired = pool.acquire_pooled(&address, None, false, false).await;
        assert!(reacquired.is_none());
    }

    #[tokio::test]
    async fn eviction_sweep_picks_longest_idle_over_cap() {
        let inner = PoolInner {
            config: Config {
                max_idle_connections: 2,
                keep_alive: Duration::from_secs(300),
            },
            connections: Mutex::new(vec![
                make_connection("a"),
                make_connection("b"),
                make_connection("c"),
            ]),
            maintenance_scheduled: AtomicBool::new(false),
        };

        // Simulate three idle connections with ages 6, 2, 1 minutes by
        // forcing idle_at back in time is not exposed publicly; instead
        // exercise the "over cap" branch directly, which fires regardless
        // of age once idle.len() > max_idle_connections.
        match sweep(&inner) {
            SweepOutcome::RunAgain(Some(_)) => {}
            _ => panic!("expected an eviction, got a different outcome"),
        }
        assert_eq!(inner.connections.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dropping_without_release_still_frees_capacity() {
        let pool = Pool::new(Config::default());
        let conn = make_connection("example.com");
        let address = conn.route.address.clone();
        let pooled = pool.insert(conn);
        drop(pooled); // no explicit release() -> logs a leak warning

        let reacquired = pool.acquire_pooled(&address, None, false, false).await;
        assert!(reacquired.is_some());
    }
}
