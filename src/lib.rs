//! Connection acquisition core for an HTTP client.
//!
//! This crate owns everything between "a call needs a connection to
//! `https://host:port`" and "here is a live, pooled transport ready for an
//! exchange codec to drive": DNS resolution, proxy selection, Happy-
//! Eyeballs-style racing of candidate routes, the CONNECT tunnel and TLS
//! handshake, and the connection pool itself, including HTTP/2
//! coalescing, idle eviction, and leak detection. It does not speak HTTP —
//! request/response framing and body codecs live on the far side of the
//! [`exchange::Carrier`] boundary.
//!
//! ```text
//! ClientConfig -> AddressKey -> RoutePlanner -> FastFallbackFinder -> Pooled<RealConnection>
//! ```

pub mod address;
pub mod cancel;
pub mod config;
pub mod connect_plan;
pub mod dns;
pub mod error;
pub mod events;
pub mod exchange;
pub mod fast_fallback;
pub mod pool;
pub mod proxy;
pub mod real_connection;
pub mod route;
pub mod route_planner;
pub mod route_selector;
pub mod tls_spec;

pub use address::{AddressKey, Protocol, Scheme};
pub use cancel::CancelToken;
pub use config::{Builder, ClientConfig};
pub use connect_plan::{ConnectOptions, ConnectOutcome, ConnectPlan};
pub use error::{Error, Result};
pub use events::EventListener;
pub use exchange::{Carrier, PooledCarrier};
pub use fast_fallback::FastFallbackFinder;
pub use pool::{Pool, Pooled};
pub use proxy::{Proxy, ProxyAuth, ProxySelector};
pub use real_connection::RealConnection;
pub use route::{Route, RouteDB};
pub use route_planner::{Plan, RoutePlanner};
pub use route_selector::RouteSelector;
pub use tls_spec::{CertificatePinner, ConnectionSpec, TlsConfig, TlsFallbackSequence};
