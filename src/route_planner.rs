//! Policy: reuse call's connection → reuse from pool → plan a new Route →
//! connect → recheck pool for coalescing (§4.2).

use std::sync::Arc;

use crate::{
    address::AddressKey,
    connect_plan::{ConnectOptions, ConnectPlan},
    error::Error,
    pool::Pooled,
    route::{Route, RouteDB},
    route_selector::{RouteSelector, Selection},
};

/// What `RoutePlanner::plan` decided to do next (§9 "Plan has the variants
/// ReusePlan, ConnectPlan, FailedPlan").
pub enum Plan {
    /// A connection is already available — no background connect needed.
    Reused(Pooled),
    /// A fresh connect attempt must be raced by the `FastFallbackFinder`.
    New(ConnectPlan),
}

impl Plan {
    pub fn is_connected(&self) -> bool {
        matches!(self, Plan::Reused(_))
    }
}

/// Tracks why a prior connection on this planner failed, to decide whether
/// a queued retry route should be tried transparently (§4.2).
#[derive(Default)]
struct FailureCounters {
    refused_stream_count: u32,
    connection_shutdown_count: u32,
    other_failure_count: u32,
}

pub struct RoutePlanner {
    address: AddressKey,
    pool: crate::pool::Pool,
    route_db: Arc<RouteDB>,
    fast_fallback: bool,
    connect_options: ConnectOptions,

    existing: Option<Pooled>,
    selector: Option<RouteSelector>,
    selection: Option<Selection>,
    queued_retry: Option<Route>,
    failures: FailureCounters,
}

impl RoutePlanner {
    pub fn new(
        address: AddressKey,
        pool: crate::pool::Pool,
        route_db: Arc<RouteDB>,
        fast_fallback: bool,
        connect_options: ConnectOptions,
    ) -> Self {
        RoutePlanner {
            address,
            pool,
            route_db,
            fast_fallback,
            connect_options,
            existing: None,
            selector: None,
            selection: None,
            queued_retry: None,
            failures: FailureCounters::default(),
        }
    }

    /// Call sites hand back their previously acquired connection here
    /// before asking for a new `Plan`, so step 1 can consider reusing it.
    pub fn set_existing_connection(&mut self, pooled: Pooled) {
        self.existing = Some(pooled);
    }

    pub fn same_host_and_port(&self, host: &str, port: u16) -> bool {
        self.address.host.as_ref() == host && self.address.port == port
    }

    pub fn route_db(&self) -> &Arc<RouteDB> {
        &self.route_db
    }

    /// Records a mid-stream failure so the next `plan()` can decide
    /// whether to transparently retry a queued route (only on first
    /// refusal or shutdown, never on generic IO failures, per §4.2).
    pub fn record_refused_stream(&mut self, route: Route) {
        self.failures.refused_stream_count += 1;
        if self.failures.refused_stream_count == 1 {
            self.queued_retry = Some(route);
        }
    }

    pub fn record_connection_shutdown(&mut self, route: Route) {
        self.failures.connection_shutdown_count += 1;
        if self.failures.connection_shutdown_count == 1 {
            self.queued_retry = Some(route);
        }
    }

    pub fn record_other_failure(&mut self) {
        self.failures.other_failure_count += 1;
    }

    pub fn has_more_routes(&self) -> bool {
        self.queued_retry.is_some()
            || self
                .selection
                .as_ref()
                .map(|s| s.has_next())
                .unwrap_or(false)
            || self.selector.as_ref().map(|s| s.has_next()).unwrap_or(true)
    }

    pub async fn plan(&mut self) -> Result<Plan, Error> {
        // Step 1: reuse the call's existing connection.
        if let Some(pooled) = self.existing.take() {
            let healthy = pooled.connection().is_healthy(true).await;
            let same_host = self.same_host_and_port(
                &pooled.connection().route.address.host,
                pooled.connection().route.address.port,
            );
            if healthy && same_host && !pooled.connection().no_new_exchanges() {
                return Ok(Plan::Reused(pooled));
            }
            // Not reusable: release it (closes if orphaned via Drop).
            drop(pooled);
        }

        // Step 2: pool lookup #1 — address only, no resolved routes yet.
        if let Some(pooled) = self
            .pool
            .acquire_pooled(&self.address, None, false, true)
            .await
        {
            return Ok(Plan::Reused(pooled));
        }

        // Step 3: plan a new route.
        let route = self.next_route().await?;

        // Step 4: pool lookup #2 — now that we know candidate IPs, allow
        // coalescing onto an HTTP/2 connection to the same peer.
        let remaining_routes: Vec<Route> = self
            .selection
            .as_ref()
            .map(|s| s.remaining().to_vec())
            .unwrap_or_default();
        let mut all_routes = vec![route.clone()];
        all_routes.extend(remaining_routes);

        if let Some(pooled) = self
            .pool
            .acquire_pooled(&self.address, Some(&all_routes), true, true)
            .await
        {
            return Ok(Plan::Reused(pooled));
        }

        Ok(Plan::New(ConnectPlan::new(route, self.connect_options.clone())))
    }

    async fn next_route(&mut self) -> Result<Route, Error> {
        if let Some(route) = self.queued_retry.take() {
            return Ok(route);
        }

        loop {
            if let Some(selection) = self.selection.as_mut() {
                if let Some(route) = selection.next() {
                    return Ok(route);
                }
            }

            if self.selector.is_none() {
                self.selector = Some(
                    RouteSelector::new(self.address.clone(), self.route_db.clone(), self.fast_fallback)
                        .await?,
                );
            }

            let selector = self.selector.as_mut().expect("just initialized");
            if !selector.has_next() {
                return Err(Error::planning("exhausted all routes"));
            }

            let selection = selector.next().await?;
            self.selection = Some(selection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::Scheme,
        dns::{Resolve, Resolving},
        pool::{Config as PoolConfig, Pool},
    };
    use std::net::IpAddr;

    struct OneAddr;
    impl Resolve for OneAddr {
        fn resolve(&self, _host: &str) -> Resolving {
            Box::pin(async { Ok(vec!["127.0.0.1".parse::<IpAddr>().unwrap()]) })
        }
    }

    #[tokio::test]
    async fn plans_a_new_connect_when_pool_is_empty() {
        let address = AddressKey::new(Scheme::Http, "example.com", 80, Arc::new(OneAddr));
        let pool = Pool::new(PoolConfig::default());
        let route_db = Arc::new(RouteDB::new());
        let mut planner = RoutePlanner::new(
            address,
            pool,
            route_db,
            false,
            ConnectOptions::default(),
        );

        let plan = planner.plan().await.unwrap();
        assert!(!plan.is_connected());
    }

    #[tokio::test]
    async fn exhausted_routes_error_when_no_proxies_resolve() {
        struct Failing;
        impl Resolve for Failing {
            fn resolve(&self, _host: &str) -> Resolving {
                Box::pin(async { Err("boom".into()) })
            }
        }

        let address = AddressKey::new(Scheme::Http, "example.com", 80, Arc::new(Failing));
        let pool = Pool::new(PoolConfig::default());
        let route_db = Arc::new(RouteDB::new());
        let mut planner = RoutePlanner::new(
            address,
            pool,
            route_db,
            false,
            ConnectOptions::default(),
        );

        let err = planner.plan().await.unwrap_err();
        assert!(!err.is_canceled());
    }
}
