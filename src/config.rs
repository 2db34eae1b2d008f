//! Top-level configuration, grounded on `src/core/client/mod.rs`'s
//! `Builder` (§6.1): one builder assembling the resolver, proxy selector,
//! TLS config, pool config, and per-attempt connect options that an
//! [`crate::address::AddressKey`] needs.

use std::{net::IpAddr, sync::Arc, time::Duration};

use crate::{
    address::{AddressKey, Protocol, Scheme},
    connect_plan::ConnectOptions,
    dns::{GaiResolver, Resolve},
    events::{EventListener, NoOpListener},
    pool::{self, Pool},
    proxy::ProxySelector,
    tls_spec::TlsConfig,
};

/// Intra-plan Happy-Eyeballs delay between racing additional resolved
/// addresses of a single `Route` (distinct from the 250 ms inter-plan delay
/// `FastFallbackFinder` uses between distinct routes).
const DEFAULT_HAPPY_EYEBALLS_TIMEOUT: Duration = Duration::from_millis(250);

/// Assembled configuration shared by every [`AddressKey`] a client builds.
/// Cheap to clone: everything behind an `Arc`.
#[derive(Clone)]
pub struct ClientConfig {
    pub resolver: Arc<dyn Resolve>,
    pub proxy_selector: Option<Arc<dyn ProxySelector>>,
    pub tls: Option<Arc<TlsConfig>>,
    pub protocols: Arc<Vec<Protocol>>,
    pub pool: Pool,
    pub connect: ConnectOptions,
    pub fast_fallback: bool,
    pub retry_on_connection_failure: bool,
    pub ping_interval: Option<Duration>,
    pub happy_eyeballs_timeout: Duration,
    pub local_address_v4: Option<IpAddr>,
    pub local_address_v6: Option<IpAddr>,
    pub tcp_keepalive: Option<Duration>,
    pub listener: Arc<dyn EventListener>,
}

impl ClientConfig {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Builds the [`AddressKey`] a `RoutePlanner` plans routes for, given a
    /// target scheme/host/port. TLS is attached only for `https`.
    pub fn address_for(&self, scheme: Scheme, host: impl Into<Arc<str>>, port: u16) -> AddressKey {
        let mut key = AddressKey::new(scheme, host, port, self.resolver.clone())
            .with_protocols((*self.protocols).clone());

        if let Some(selector) = &self.proxy_selector {
            key = key.with_proxy_selector(selector.clone());
        }
        if scheme == Scheme::Https {
            if let Some(tls) = &self.tls {
                key = key.with_tls(tls.clone());
            }
        }
        key
    }
}

pub struct Builder {
    resolver: Arc<dyn Resolve>,
    proxy_selector: Option<Arc<dyn ProxySelector>>,
    tls: Option<Arc<TlsConfig>>,
    protocols: Vec<Protocol>,
    pool_config: pool::Config,
    connect: ConnectOptions,
    fast_fallback: bool,
    retry_on_connection_failure: bool,
    ping_interval: Option<Duration>,
    happy_eyeballs_timeout: Duration,
    local_address_v4: Option<IpAddr>,
    local_address_v6: Option<IpAddr>,
    tcp_keepalive: Option<Duration>,
    listener: Arc<dyn EventListener>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            resolver: Arc::new(GaiResolver::new()),
            proxy_selector: None,
            tls: None,
            protocols: vec![Protocol::Http1_1, Protocol::Http2],
            pool_config: pool::Config::default(),
            connect: ConnectOptions::default(),
            fast_fallback: true,
            retry_on_connection_failure: true,
            ping_interval: None,
            happy_eyeballs_timeout: DEFAULT_HAPPY_EYEBALLS_TIMEOUT,
            local_address_v4: None,
            local_address_v6: None,
            tcp_keepalive: None,
            listener: Arc::new(NoOpListener),
        }
    }
}

impl Builder {
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = Some(selector);
        self
    }

    pub fn tls_config(mut self, tls: Arc<TlsConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn max_idle_connections(mut self, max: usize) -> Self {
        self.pool_config.max_idle_connections = max;
        self
    }

    pub fn keep_alive_duration(mut self, duration: Duration) -> Self {
        self.pool_config.keep_alive = duration;
        self
    }

    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.connect.connect_timeout = Some(duration);
        self
    }

    pub fn read_timeout(mut self, duration: Duration) -> Self {
        self.connect.read_timeout = Some(duration);
        self
    }

    pub fn write_timeout(mut self, duration: Duration) -> Self {
        self.connect.write_timeout = Some(duration);
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.connect.tcp_nodelay = enabled;
        self
    }

    pub fn tcp_keepalive(mut self, duration: Duration) -> Self {
        self.tcp_keepalive = Some(duration);
        self
    }

    pub fn local_address_v4(mut self, addr: IpAddr) -> Self {
        self.local_address_v4 = Some(addr);
        self
    }

    pub fn local_address_v6(mut self, addr: IpAddr) -> Self {
        self.local_address_v6 = Some(addr);
        self
    }

    pub fn fast_fallback(mut self, enabled: bool) -> Self {
        self.fast_fallback = enabled;
        self
    }

    pub fn retry_on_connection_failure(mut self, enabled: bool) -> Self {
        self.retry_on_connection_failure = enabled;
        self
    }

    pub fn ping_interval(mut self, duration: Duration) -> Self {
        self.ping_interval = Some(duration);
        self
    }

    pub fn happy_eyeballs_timeout(mut self, duration: Duration) -> Self {
        self.happy_eyeballs_timeout = duration;
        self
    }

    pub fn user_agent(mut self, value: impl Into<Arc<str>>) -> Self {
        self.connect.user_agent = Some(value.into());
        self
    }

    pub fn event_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn build(self) -> ClientConfig {
        ClientConfig {
            resolver: self.resolver,
            proxy_selector: self.proxy_selector,
            tls: self.tls,
            protocols: Arc::new(self.protocols),
            pool: Pool::new(self.pool_config),
            connect: self.connect,
            fast_fallback: self.fast_fallback,
            retry_on_connection_failure: self.retry_on_connection_failure,
            ping_interval: self.ping_interval,
            happy_eyeballs_timeout: self.happy_eyeballs_timeout,
            local_address_v4: self.local_address_v4,
            local_address_v6: self.local_address_v6,
            tcp_keepalive: self.tcp_keepalive,
            listener: self.listener,
        }
    }
}
