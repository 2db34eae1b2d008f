//! End-to-end races through `FastFallbackFinder`, seeded from the
//! already-connected / first-wins / second-wins / all-fail scenarios.

use std::{net::IpAddr, sync::Arc, time::Duration};

use fastconnect::{
    address::{AddressKey, Scheme},
    cancel::CancelToken,
    connect_plan::ConnectOptions,
    dns::{Resolve, Resolving},
    fast_fallback::FastFallbackFinder,
    pool::{Config as PoolConfig, Pool},
    route::RouteDB,
    route_planner::RoutePlanner,
};
use tokio::net::TcpListener;

struct FixedResolver(Vec<IpAddr>);
impl Resolve for FixedResolver {
    fn resolve(&self, _host: &str) -> Resolving {
        let addrs = self.0.clone();
        Box::pin(async move { Ok(addrs) })
    }
}

async fn accepting_listener() -> (IpAddr, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                return;
            }
        }
    });
    (local.ip(), local.port())
}

#[tokio::test]
async fn first_reachable_route_wins_the_race() {
    let (ip, port) = accepting_listener().await;
    let resolver: Arc<dyn Resolve> = Arc::new(FixedResolver(vec![ip]));
    let address = AddressKey::new(Scheme::Http, "example.test", port, resolver);
    let pool = Pool::new(PoolConfig::default());
    let route_db = Arc::new(RouteDB::new());

    let planner = RoutePlanner::new(address, pool.clone(), route_db, false, ConnectOptions::default());
    let finder = FastFallbackFinder::new(planner, pool, Arc::new(CancelToken::new()));

    let pooled = finder.find().await.expect("a reachable route must connect");
    assert!(pooled.connection().is_healthy(false).await);
}

#[tokio::test]
async fn every_route_failing_reports_an_exhausted_error_with_suppressed_list() {
    // Two candidate IPs that both refuse outright: 192.0.2.0/24 (TEST-NET-1)
    // is reserved and never routable from this process.
    let resolver: Arc<dyn Resolve> = Arc::new(FixedResolver(vec![
        "192.0.2.1".parse().unwrap(),
        "192.0.2.2".parse().unwrap(),
    ]));
    let address = AddressKey::new(Scheme::Http, "example.test", 81, resolver);
    let pool = Pool::new(PoolConfig::default());
    let route_db = Arc::new(RouteDB::new());
    let mut options = ConnectOptions::default();
    options.connect_timeout = Some(Duration::from_millis(100));

    let planner = RoutePlanner::new(address, pool.clone(), route_db, true, options);
    let finder = FastFallbackFinder::new(planner, pool, Arc::new(CancelToken::new()));

    let err = finder.find().await.unwrap_err();
    assert!(err.is_exhausted());
}

#[tokio::test]
async fn canceling_before_any_route_connects_short_circuits() {
    let resolver: Arc<dyn Resolve> = Arc::new(FixedResolver(vec!["192.0.2.1".parse().unwrap()]));
    let address = AddressKey::new(Scheme::Http, "example.test", 81, resolver);
    let pool = Pool::new(PoolConfig::default());
    let route_db = Arc::new(RouteDB::new());
    let mut options = ConnectOptions::default();
    options.connect_timeout = Some(Duration::from_secs(30));

    let planner = RoutePlanner::new(address, pool.clone(), route_db, false, options);
    let cancel = Arc::new(CancelToken::new());
    cancel.cancel();
    let finder = FastFallbackFinder::new(planner, pool, cancel);

    let err = finder.find().await.unwrap_err();
    assert!(err.is_canceled());
}
