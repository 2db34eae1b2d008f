//! TLS configuration and fallback sequencing (§4.5), grounded in the
//! builder-pattern style of `src/tls/config.rs` but scoped to the fields
//! the core actually needs: enabled protocol versions, cipher suites, and
//! an ordered fallback list rustls can apply per attempt.

use std::sync::Arc;

use crate::error::BoxError;

/// TLS protocol versions a [`ConnectionSpec`] may enable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// An immutable bundle of TLS parameters applicable to one handshake
/// attempt, and sequenceable as a fallback chain (§4.5).
#[derive(Clone, Debug)]
pub struct ConnectionSpec {
    pub versions: Vec<TlsVersion>,
    pub cipher_suites: Vec<rustls::SupportedCipherSuite>,
    pub supports_tls_extensions: bool,
    pub is_cleartext: bool,
}

impl ConnectionSpec {
    /// The modern, restrictive spec: TLS 1.3 and 1.2 only, with the
    /// default rustls cipher suite set, extensions on.
    pub fn modern_tls() -> Self {
        ConnectionSpec {
            versions: vec![TlsVersion::Tls13, TlsVersion::Tls12],
            cipher_suites: rustls::DEFAULT_CIPHER_SUITES.to_vec(),
            supports_tls_extensions: true,
            is_cleartext: false,
        }
    }

    /// A conservative fallback spec tried after `modern_tls` fails with a
    /// retryable `SSLException`-equivalent: TLS 1.2 only.
    pub fn compatible_tls() -> Self {
        ConnectionSpec {
            versions: vec![TlsVersion::Tls12],
            cipher_suites: rustls::DEFAULT_CIPHER_SUITES.to_vec(),
            supports_tls_extensions: true,
            is_cleartext: false,
        }
    }

    pub fn cleartext() -> Self {
        ConnectionSpec {
            versions: Vec::new(),
            cipher_suites: Vec::new(),
            supports_tls_extensions: false,
            is_cleartext: true,
        }
    }

    fn protocol_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        self.versions
            .iter()
            .map(|v| match v {
                TlsVersion::Tls12 => &rustls::version::TLS12,
                TlsVersion::Tls13 => &rustls::version::TLS13,
            })
            .collect()
    }
}

/// Ordered TLS handshake configurations with fallback, reached through
/// `AddressKey::tls`. §4.5: a failed handshake retries against the next spec
/// whose protocol/cipher intersection is non-empty.
pub struct TlsFallbackSequence {
    specs: Vec<ConnectionSpec>,
}

impl TlsFallbackSequence {
    pub fn new(specs: Vec<ConnectionSpec>) -> Self {
        assert!(!specs.is_empty(), "a fallback sequence needs >=1 spec");
        TlsFallbackSequence { specs }
    }

    pub fn modern_with_fallback() -> Self {
        TlsFallbackSequence::new(vec![
            ConnectionSpec::modern_tls(),
            ConnectionSpec::compatible_tls(),
        ])
    }

    pub fn spec_at(&self, index: usize) -> Option<&ConnectionSpec> {
        self.specs.get(index)
    }

    /// "Next compatible ConnectionSpec" per §4.5: the next spec in the
    /// ordered list after `index` whose cipher suites are non-empty for a
    /// cleartext-incompatible handshake. Returns `None` when the sequence
    /// is exhausted — the caller then has no TLS fallback left to try.
    pub fn next_compatible(&self, index: usize) -> Option<usize> {
        self.specs
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, spec)| !spec.is_cleartext && !spec.cipher_suites.is_empty())
            .map(|(i, _)| i)
    }
}

/// TLS-related configuration carried on an [`crate::address::AddressKey`]:
/// certificate pinner, hostname verifier, the connector itself, supported
/// protocols, and the fallback sequence.
pub struct TlsConfig {
    pub fallback_sequence: TlsFallbackSequence,
    pub hostname_verification: bool,
    pub pinner: Option<Arc<dyn CertificatePinner>>,
    pub root_store: Arc<rustls::RootCertStore>,
}

impl PartialEq for TlsConfig {
    fn eq(&self, other: &Self) -> bool {
        // Identity-ish equality: same root store pointer and same pinner
        // pointer. Two independently-built configs that happen to specify
        // identical roots are *not* pool-interchangeable in the source
        // behavior, only configs that are the literal same instance.
        Arc::ptr_eq(&self.root_store, &other.root_store)
            && match (&self.pinner, &other.pinner) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

/// Verifies a peer certificate chain is valid for an additional hostname,
/// used by coalescing eligibility checks (§4.6) and by pinning.
pub trait CertificatePinner: Send + Sync {
    fn check(&self, hostname: &str, chain: &[Vec<u8>]) -> Result<(), BoxError>;
}

/// Constructs a `rustls::ClientConfig` for one handshake attempt from a
/// [`ConnectionSpec`], applying the spec's protocol/cipher restriction.
/// ALPN identifiers are encoded per RFC 7301 by `rustls` itself once the
/// protocol list is set on the resulting config.
pub(crate) fn client_config_for_spec(
    spec: &ConnectionSpec,
    root_store: Arc<rustls::RootCertStore>,
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<rustls::ClientConfig, BoxError> {
    let versions = spec.protocol_versions();
    let mut builder = rustls::ClientConfig::builder()
        .with_cipher_suites(&spec.cipher_suites)
        .with_safe_default_kx_groups()
        .with_protocol_versions(&versions)
        .map_err(|e| Box::new(e) as BoxError)?
        .with_root_certificates((*root_store).clone())
        .with_no_client_auth();
    builder.alpn_protocols = alpn_protocols;
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_sequence_skips_cleartext_when_searching_next() {
        let seq = TlsFallbackSequence::new(vec![
            ConnectionSpec::modern_tls(),
            ConnectionSpec::cleartext(),
            ConnectionSpec::compatible_tls(),
        ]);
        assert_eq!(seq.next_compatible(0), Some(2));
    }

    #[test]
    fn fallback_sequence_exhausts() {
        let seq = TlsFallbackSequence::modern_with_fallback();
        assert_eq!(seq.next_compatible(0), Some(1));
        assert_eq!(seq.next_compatible(1), None);
    }
}
