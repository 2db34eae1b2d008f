//! Proxy selection, grounded on `src/proxy/matcher.rs` of the prior art:
//! environment-derived proxy selection (`HTTP_PROXY`/`HTTPS_PROXY`/
//! `ALL_PROXY`/`NO_PROXY`) plus an explicit static override.

use std::{fmt, sync::Arc};

use crate::error::BoxError;

/// One hop a [`crate::route::Route`] may go through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    Http(Arc<str>, u16),
    Socks(Arc<str>, u16),
}

impl Proxy {
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Proxy::Direct => None,
            Proxy::Http(host, _) | Proxy::Socks(host, _) => Some(host),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Proxy::Direct => None,
            Proxy::Http(_, port) | Proxy::Socks(_, port) => Some(*port),
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => write!(f, "DIRECT"),
            Proxy::Http(h, p) => write!(f, "HTTP {h}:{p}"),
            Proxy::Socks(h, p) => write!(f, "SOCKS {h}:{p}"),
        }
    }
}

/// Credentials supplied by a proxy authenticator in response to a `407`
/// during the CONNECT tunnel loop (§4.4).
#[derive(Clone)]
pub struct ProxyAuth {
    pub header_value: Arc<str>,
}

/// Consulted by [`crate::route_selector::RouteSelector`] when an
/// [`crate::address::AddressKey`] carries no explicit proxy override.
///
/// `select` is called once per target URL (scheme + host); it returns an
/// ordered list of proxies to try, `Direct` being a valid entry like any
/// other. Errors are non-fatal to the caller — `RouteSelector` treats a
/// `select` failure the same as an empty list.
pub trait ProxySelector: Send + Sync {
    fn select(&self, scheme: &str, host: &str) -> Result<Vec<Proxy>, BoxError>;

    /// Supply credentials for a `407 Proxy Authentication Required`
    /// response during the CONNECT loop. Returning `None` means the
    /// authenticator declines and the tunnel attempt fails.
    fn authenticate(&self, _proxy: &Proxy, _realm: Option<&str>) -> Option<ProxyAuth> {
        None
    }

    /// Structural identity used by `AddressKey` equality, the same way
    /// [`crate::dns::Resolve::identity`] is: same concrete selector type is
    /// treated as pool-interchangeable.
    fn identity(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Always resolves to a single fixed proxy (or `Direct`), ignoring the
/// environment. Mirrors explicitly configuring `.proxy(...)` on the
/// teacher's client builder rather than relying on env/system discovery.
pub struct StaticProxySelector {
    proxies: Vec<Proxy>,
}

impl StaticProxySelector {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        StaticProxySelector { proxies }
    }

    pub fn single(proxy: Proxy) -> Self {
        StaticProxySelector {
            proxies: vec![proxy],
        }
    }
}

impl ProxySelector for StaticProxySelector {
    fn select(&self, _scheme: &str, _host: &str) -> Result<Vec<Proxy>, BoxError> {
        Ok(self.proxies.clone())
    }
}

/// Reads `HTTP_PROXY`, `HTTPS_PROXY`, `ALL_PROXY` and honors `NO_PROXY`
/// (domain suffix, exact host, or CIDR matches), in the manner of
/// `src/proxy/matcher.rs`'s `NoProxy`/`Builder::from_env`.
pub struct EnvProxySelector {
    http: Option<Proxy>,
    https: Option<Proxy>,
    all: Option<Proxy>,
    no_proxy: NoProxy,
}

impl EnvProxySelector {
    pub fn from_env() -> Self {
        EnvProxySelector {
            http: get_env("HTTP_PROXY")
                .or_else(|| get_env("http_proxy"))
                .and_then(|v| parse_proxy_uri(&v)),
            https: get_env("HTTPS_PROXY")
                .or_else(|| get_env("https_proxy"))
                .and_then(|v| parse_proxy_uri(&v)),
            all: get_env("ALL_PROXY")
                .or_else(|| get_env("all_proxy"))
                .and_then(|v| parse_proxy_uri(&v)),
            no_proxy: NoProxy::from_string(
                &get_env("NO_PROXY")
                    .or_else(|| get_env("no_proxy"))
                    .unwrap_or_default(),
            ),
        }
    }
}

impl ProxySelector for EnvProxySelector {
    fn select(&self, scheme: &str, host: &str) -> Result<Vec<Proxy>, BoxError> {
        if self.no_proxy.contains(host) {
            return Ok(vec![Proxy::Direct]);
        }

        let chosen = match scheme {
            "https" => self.https.clone().or_else(|| self.all.clone()),
            _ => self.http.clone().or_else(|| self.all.clone()),
        };

        Ok(vec![chosen.unwrap_or(Proxy::Direct)])
    }
}

fn get_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_proxy_uri(value: &str) -> Option<Proxy> {
    let without_scheme = value
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(value);
    let authority = without_scheme.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if value.starts_with("socks") {
        Some(Proxy::Socks(host.into(), port))
    } else {
        Some(Proxy::Http(host.into(), port))
    }
}

struct NoProxy {
    domains: Vec<String>,
    ips: Vec<ipnet::IpNet>,
}

impl NoProxy {
    fn from_string(list: &str) -> Self {
        let mut domains = Vec::new();
        let mut ips = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Ok(net) = part.parse::<ipnet::IpNet>() {
                ips.push(net);
            } else if let Ok(addr) = part.parse::<std::net::IpAddr>() {
                ips.push(ipnet::IpNet::from(addr));
            } else {
                domains.push(part.trim_start_matches('.').to_ascii_lowercase());
            }
        }
        NoProxy { domains, ips }
    }

    fn contains(&self, host: &str) -> bool {
        if let Ok(addr) = host.parse::<std::net::IpAddr>() {
            return self.ips.iter().any(|net| net.contains(&addr));
        }
        let host = host.to_ascii_lowercase();
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_proxy_matches_suffix() {
        let np = NoProxy::from_string("example.com,10.0.0.0/8");
        assert!(np.contains("example.com"));
        assert!(np.contains("api.example.com"));
        assert!(!np.contains("example.org"));
        assert!(np.contains("10.1.2.3"));
        assert!(!np.contains("11.1.2.3"));
    }

    #[test]
    fn parse_http_proxy_uri() {
        let p = parse_proxy_uri("http://proxy.local:8080").unwrap();
        assert_eq!(p, Proxy::Http("proxy.local".into(), 8080));
    }

    #[test]
    fn parse_socks_proxy_uri() {
        let p = parse_proxy_uri("socks5://proxy.local:1080").unwrap();
        assert_eq!(p, Proxy::Socks("proxy.local".into(), 1080));
    }

    #[test]
    fn static_selector_ignores_scheme() {
        let sel = StaticProxySelector::single(Proxy::Http("p".into(), 80));
        assert_eq!(sel.select("https", "host").unwrap(), vec![Proxy::Http("p".into(), 80)]);
    }
}
