use std::{error::Error as StdError, fmt, io};

/// A boxed error type used throughout the crate for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The error type produced by connection acquisition.
///
/// Wraps an internal [`Kind`] plus an optional source error. For the
/// [`Kind::Exhausted`] case, every other attempt's error is retained as a
/// suppressed error so callers can see the full set of routes that failed.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    suppressed: Vec<Error>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Bad configuration made connecting impossible (e.g. H2 prior
    /// knowledge requested over a scheme that can't offer it).
    Planning,
    /// DNS resolution failed for a hostname.
    Resolution,
    /// TCP connect, refuse, or timeout.
    TcpConnect,
    /// The CONNECT tunnel through a proxy failed.
    Tunnel,
    /// TLS handshake, hostname verification, or pinning failure.
    TlsHandshake,
    /// The call was canceled.
    Canceled,
    /// No more routes and no more in-flight plans.
    Exhausted,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn planning<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Planning, Some(e))
    }

    pub(crate) fn resolution<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Resolution, Some(e))
    }

    pub(crate) fn tcp_connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::TcpConnect, Some(e))
    }

    pub(crate) fn tunnel<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Tunnel, Some(e))
    }

    pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::TlsHandshake, Some(e))
    }

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Canceled, None::<io::Error>)
    }

    /// Build the `Exhausted` error that `FastFallbackFinder` raises when
    /// every plan has failed: `first` becomes the visible error, the rest
    /// are attached as suppressed.
    pub(crate) fn exhausted(mut errors: Vec<Error>) -> Error {
        assert!(!errors.is_empty(), "exhausted requires at least one error");
        let first = errors.remove(0);
        let mut err = Error::new(Kind::Exhausted, None::<io::Error>);
        err.inner.suppressed = {
            let mut v = vec![first];
            v.extend(errors);
            v
        };
        err
    }

    /// The first (primary) error, if this is an [`Kind::Exhausted`] error
    /// wrapping attempts from several routes.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::TlsHandshake)
    }

    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::TcpConnect)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::Exhausted)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b = f.debug_struct("fastconnect::Error");
        b.field("kind", &self.inner.kind);
        if let Some(ref source) = self.inner.source {
            b.field("source", source);
        }
        if !self.inner.suppressed.is_empty() {
            b.field("suppressed", &self.inner.suppressed.len());
        }
        b.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Planning => write!(f, "route planning failed")?,
            Kind::Resolution => write!(f, "dns resolution failed")?,
            Kind::TcpConnect => write!(f, "tcp connect failed")?,
            Kind::Tunnel => write!(f, "proxy CONNECT tunnel failed")?,
            Kind::TlsHandshake => write!(f, "tls handshake failed")?,
            Kind::Canceled => write!(f, "connection attempt canceled")?,
            Kind::Exhausted => write!(f, "no more routes to try")?,
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        } else if let Some(first) = self.inner.suppressed.first() {
            write!(f, ": {first}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
            .or_else(|| {
                self.inner
                    .suppressed
                    .first()
                    .map(|e| e as &(dyn StdError + 'static))
            })
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err.inner.source {
            Some(source) => io::Error::new(io::ErrorKind::Other, source),
            None => io::Error::new(io::ErrorKind::Other, err.to_string()),
        }
    }
}
