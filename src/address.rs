use std::sync::Arc;

use crate::{dns::Resolve, proxy::ProxySelector, tls_spec::TlsConfig};

/// The negotiated protocols a connection to an [`AddressKey`] may use.
///
/// Ordered by preference; `h2_prior_knowledge` additionally allows skipping
/// ALPN negotiation entirely over cleartext.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1_1,
    Http2,
    Http2PriorKnowledge,
}

/// The scheme of an [`AddressKey`]; determines whether a TLS config is
/// required and the default port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The immutable identity of a destination a call connects to.
///
/// Two `AddressKey`s that compare equal (via [`PartialEq`]) are
/// pool-interchangeable: a `RealConnection` established for one may be
/// reused to serve a call for the other. Equality is structural over every
/// field except `resolver`/`proxy_selector`, which are compared by the
/// concrete backend type they're built from (see [`Resolve::identity`] and
/// [`ProxySelector::identity`]) rather than `Arc` pointer identity — two
/// separately-constructed instances of the same stateless resolver/selector
/// type are interchangeable.
#[derive(Clone)]
pub struct AddressKey {
    pub scheme: Scheme,
    pub host: Arc<str>,
    pub port: u16,
    pub resolver: Arc<dyn Resolve>,
    pub tls: Option<Arc<TlsConfig>>,
    pub proxy_selector: Option<Arc<dyn ProxySelector>>,
    pub protocols: Arc<Vec<Protocol>>,
}

impl AddressKey {
    pub fn new(
        scheme: Scheme,
        host: impl Into<Arc<str>>,
        port: u16,
        resolver: Arc<dyn Resolve>,
    ) -> Self {
        AddressKey {
            scheme,
            host: host.into(),
            port,
            resolver,
            tls: None,
            proxy_selector: None,
            protocols: Arc::new(vec![Protocol::Http1_1]),
        }
    }

    pub fn with_tls(mut self, tls: Arc<TlsConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = Some(selector);
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = Arc::new(protocols);
        self
    }

    pub fn is_https(&self) -> bool {
        matches!(self.scheme, Scheme::Https)
    }

    /// Whether another key may share a pooled connection with this one,
    /// ignoring hostname. Used by coalescing (§4.6): everything must match
    /// except the host itself.
    pub(crate) fn equal_ignoring_host(&self, other: &AddressKey) -> bool {
        self.scheme == other.scheme
            && self.port == other.port
            && self.resolver.identity() == other.resolver.identity()
            && self.tls_identity_eq(other)
            && self.proxy_selector_identity_eq(other)
    }

    fn tls_identity_eq(&self, other: &AddressKey) -> bool {
        match (&self.tls, &other.tls) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }

    fn proxy_selector_identity_eq(&self, other: &AddressKey) -> bool {
        match (&self.proxy_selector, &other.proxy_selector) {
            (None, None) => true,
            (Some(a), Some(b)) => a.identity() == b.identity(),
            _ => false,
        }
    }
}

impl PartialEq for AddressKey {
    fn eq(&self, other: &Self) -> bool {
        self.equal_ignoring_host(other) && self.host == other.host
    }
}

impl Eq for AddressKey {}

impl std::fmt::Debug for AddressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressKey")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::GaiResolver;

    fn key(host: &str) -> AddressKey {
        AddressKey::new(Scheme::Https, host, 443, Arc::new(GaiResolver::new()))
    }

    #[test]
    fn equal_keys_are_pool_interchangeable() {
        let a = key("example.com");
        let b = key("example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn different_hosts_are_not_equal_but_share_identity_otherwise() {
        let a = key("a.example.com");
        let b = key("b.example.com");
        assert_ne!(a, b);
        assert!(a.equal_ignoring_host(&b));
    }

    #[test]
    fn different_ports_break_equality() {
        let a = key("example.com");
        let mut b = key("example.com");
        b.port = 8443;
        assert_ne!(a, b);
    }
}
