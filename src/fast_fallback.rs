//! `FastFallbackFinder`: races `ConnectPlan`s 250 ms apart and returns the
//! first to succeed (§4.3).

use std::time::Duration;

use tokio::sync::mpsc;

use crate::{
    cancel::CancelToken,
    connect_plan::ConnectOutcome,
    error::Error,
    pool::{Pool, Pooled},
    route_planner::{Plan, RoutePlanner},
};

/// Delay between launching successive plans (§4.3). A plan that finishes
/// early lets the next one launch sooner; it never makes the wait longer.
const LAUNCH_DELAY: Duration = Duration::from_millis(250);

enum ConnectResult {
    Success(Pooled),
    /// A TLS-fallback or tunnel-reconnect follow-up plan to try next, ahead
    /// of any further fresh plans (§4.3).
    NextPlan(crate::connect_plan::ConnectPlan),
    Failure(Error),
}

/// Given a [`RoutePlanner`], returns a usable connection, or propagates the
/// accumulated errors if every plan fails (§4.3, §7 "Exhausted").
pub struct FastFallbackFinder {
    planner: RoutePlanner,
    pool: Pool,
    cancel: std::sync::Arc<CancelToken>,
}

impl FastFallbackFinder {
    pub fn new(planner: RoutePlanner, pool: Pool, cancel: std::sync::Arc<CancelToken>) -> Self {
        FastFallbackFinder {
            planner,
            pool,
            cancel,
        }
    }

    pub async fn find(mut self) -> Result<Pooled, Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectResult>();
        let mut tokens: Vec<std::sync::Arc<CancelToken>> = Vec::new();
        let mut errors: Vec<Error> = Vec::new();
        let mut follow_up_queue: Vec<crate::connect_plan::ConnectPlan> = Vec::new();
        // Number of spawned plans awaiting a result on `rx`.
        let mut live: usize = 0;
        let mut more_plans = true;

        loop {
            if self.cancel.is_canceled() {
                cancel_all(&tokens);
                return Err(Error::canceled());
            }

            if more_plans || !follow_up_queue.is_empty() {
                match self.launch_next_plan(&tx, &mut follow_up_queue).await {
                    LaunchOutcome::Launched(token) => {
                        tokens.push(token);
                        live += 1;
                    }
                    LaunchOutcome::ImmediateSuccess(pooled) => {
                        cancel_all(&tokens);
                        return Ok(pooled);
                    }
                    LaunchOutcome::ImmediateFailure(err) => {
                        // A planning failure (e.g. DNS/proxy resolution)
                        // costs no wall-clock time on its own: retry the
                        // next route right away rather than waiting out
                        // the inter-plan delay.
                        errors.push(err);
                        continue;
                    }
                    LaunchOutcome::NoMorePlans => {
                        more_plans = false;
                    }
                }
            }

            if live == 0 && !more_plans && follow_up_queue.is_empty() {
                break;
            }

            let wait = tokio::time::timeout(LAUNCH_DELAY, rx.recv()).await;
            match wait {
                Ok(Some(ConnectResult::Success(pooled))) => {
                    cancel_all(&tokens);
                    return Ok(pooled);
                }
                Ok(Some(ConnectResult::NextPlan(plan))) => {
                    live -= 1;
                    follow_up_queue.push(plan);
                }
                Ok(Some(ConnectResult::Failure(err))) => {
                    live -= 1;
                    // A plan canceled because a sibling already won is
                    // noise, not a reportable failure (§4.3 "suppressed").
                    if !(err.is_canceled() && self.cancel.is_canceled()) {
                        errors.push(err);
                    }
                }
                Ok(None) => {
                    // All senders dropped: nothing left in flight.
                    live = 0;
                }
                Err(_) => {
                    // 250ms elapsed with nothing resolved: loop around and
                    // launch the next plan immediately.
                }
            }
        }

        if errors.is_empty() {
            Err(Error::planning("no routes were attempted"))
        } else {
            Err(Error::exhausted(errors))
        }
    }

    async fn launch_next_plan(
        &mut self,
        tx: &mpsc::UnboundedSender<ConnectResult>,
        follow_up_queue: &mut Vec<crate::connect_plan::ConnectPlan>,
    ) -> LaunchOutcome {
        if let Some(plan) = follow_up_queue.pop() {
            return self.spawn_plan(plan, tx.clone());
        }

        if !self.planner.has_more_routes() {
            return LaunchOutcome::NoMorePlans;
        }

        match self.planner.plan().await {
            Ok(Plan::Reused(pooled)) => LaunchOutcome::ImmediateSuccess(pooled),
            Ok(Plan::New(plan)) => self.spawn_plan(plan, tx.clone()),
            Err(e) => LaunchOutcome::ImmediateFailure(e),
        }
    }

    fn spawn_plan(
        &self,
        plan: crate::connect_plan::ConnectPlan,
        tx: mpsc::UnboundedSender<ConnectResult>,
    ) -> LaunchOutcome {
        let token = plan.cancel.clone();
        let pool = self.pool.clone();
        let route = plan.route.clone();
        let route_db = self.planner.route_db().clone();
        log::debug!("launching connect plan for {route:?}");

        tokio::spawn(async move {
            let result = plan.connect().await;
            let message = match result {
                Ok(ConnectOutcome::Connection(conn)) => {
                    route_db.mark_succeeded(&route);
                    let conn = std::sync::Arc::new(conn);

                    // Pool lookup #3 (§4.4 handleSuccess): a racing sibling
                    // may have already published a multiplexed connection
                    // to this peer (same address, or coalescible by cert)
                    // while this one was still handshaking. Only H2 needs
                    // this check — two H1 connections to the same peer are
                    // just two usable connections, not a duplicate.
                    let pooled = if conn.is_multiplexed() {
                        match pool
                            .acquire_pooled(
                                &route.address,
                                Some(std::slice::from_ref(&route)),
                                true,
                                true,
                            )
                            .await
                        {
                            Some(existing) => {
                                log::debug!(
                                    "discarding redundant H2 connection to {}, reusing a sibling's",
                                    route.address.host
                                );
                                conn.close().await;
                                existing
                            }
                            None => pool.insert(conn),
                        }
                    } else {
                        pool.insert(conn)
                    };

                    ConnectResult::Success(pooled)
                }
                Ok(ConnectOutcome::FollowUp(next)) => ConnectResult::NextPlan(next),
                Err(e) => {
                    log::debug!("connect plan for {route:?} failed: {e}");
                    // A canceled plan didn't fail on its own merits — a
                    // sibling route won the race or the whole find() was
                    // externally canceled. Don't penalize the route for it.
                    if !e.is_canceled() {
                        route_db.mark_failed(&route);
                    }
                    ConnectResult::Failure(e)
                }
            };
            let _ = tx.send(message);
        });

        LaunchOutcome::Launched(token)
    }
}

enum LaunchOutcome {
    Launched(std::sync::Arc<CancelToken>),
    ImmediateSuccess(Pooled),
    ImmediateFailure(Error),
    NoMorePlans,
}

fn cancel_all(tokens: &[std::sync::Arc<CancelToken>]) {
    for t in tokens {
        t.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{AddressKey, Scheme},
        connect_plan::ConnectOptions,
        dns::{Resolve, Resolving},
        pool::Config as PoolConfig,
        route::{Route, RouteDB},
    };
    use std::{net::IpAddr, sync::Arc};

    struct Unreachable;
    impl Resolve for Unreachable {
        fn resolve(&self, _host: &str) -> Resolving {
            // TEST-NET-1 (RFC 5737): guaranteed not to accept connections.
            Box::pin(async { Ok(vec!["192.0.2.1".parse::<IpAddr>().unwrap()]) })
        }
    }

    #[tokio::test]
    async fn exhausted_when_every_route_fails_to_connect() {
        let address = AddressKey::new(Scheme::Http, "example.invalid", 81, Arc::new(Unreachable));
        let pool = Pool::new(PoolConfig::default());
        let route_db = Arc::new(RouteDB::new());
        let mut options = ConnectOptions::default();
        options.connect_timeout = Some(Duration::from_millis(50));

        let planner = RoutePlanner::new(address, pool.clone(), route_db, false, options);
        let finder = FastFallbackFinder::new(planner, pool, Arc::new(CancelToken::new()));

        let err = finder.find().await.unwrap_err();
        assert!(!err.is_canceled());
    }

    #[tokio::test]
    async fn failed_connects_are_recorded_in_the_route_db() {
        let address = AddressKey::new(Scheme::Http, "example.invalid", 81, Arc::new(Unreachable));
        let pool = Pool::new(PoolConfig::default());
        let route_db = Arc::new(RouteDB::new());
        let mut options = ConnectOptions::default();
        options.connect_timeout = Some(Duration::from_millis(50));

        let planner = RoutePlanner::new(address, pool.clone(), route_db.clone(), false, options);
        let finder = FastFallbackFinder::new(planner, pool, Arc::new(CancelToken::new()));

        finder.find().await.unwrap_err();

        let route = Route::new(
            AddressKey::new(Scheme::Http, "example.invalid", 81, Arc::new(Unreachable)),
            crate::proxy::Proxy::Direct,
            "192.0.2.1:81".parse().unwrap(),
        );
        assert!(route_db.has_failed(&route));
    }

    #[tokio::test]
    async fn external_cancellation_is_observed() {
        let address = AddressKey::new(Scheme::Http, "example.invalid", 81, Arc::new(Unreachable));
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
}
