//! `ConnectPlan`: one attempt at establishing a connection along a
//! [`Route`] — TCP, optional CONNECT tunnel, optional TLS (§4.4).

use std::{
    fmt,
    io,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{
    address::Protocol,
    cancel::CancelToken,
    error::{BoxError, Error},
    proxy::{Proxy, ProxyAuth},
    real_connection::{Handshake, NegotiatedProtocol, RealConnection},
    route::Route,
    tls_spec,
};

/// Cap on CONNECT-tunnel retries within a single plan (§4.4). Proxy
/// authenticator retries are treated as fresh follow-up plans rather than
/// incrementing this counter — see DESIGN.md's Open Question resolution.
const MAX_TUNNEL_ATTEMPTS: u32 = 21;

/// Unifies TCP, TLS, and proxy-tunneled sockets behind one boxed type so
/// `ConnectPlan` can hand any of them to a `RealConnection` uniformly.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}
pub type BoxIo = Pin<Box<dyn AsyncIo>>;

/// Options applicable to every step of a plan's connect attempt.
#[derive(Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub tcp_nodelay: bool,
    pub user_agent: Option<Arc<str>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            tcp_nodelay: true,
            user_agent: None,
        }
    }
}

/// What a [`ConnectPlan::connect`] attempt produced.
pub enum ConnectOutcome {
    /// The plan reached `READY` and produced a connection.
    Connection(RealConnection),
    /// TLS failed with a retryable error, or the proxy closed the tunnel
    /// mid-auth-loop: a fresh plan should be tried next, ahead of further
    /// fresh plans (§4.3, §4.4).
    FollowUp(ConnectPlan),
}

/// One attempt at establishing a connection along a [`Route`].
///
/// Sockets opened by a plan belong to it until `connect()` returns
/// `Connection`, or until `cancel()`/a failure closes them. At most one
/// `connect()` call per plan ever succeeds.
pub struct ConnectPlan {
    pub route: Route,
    pub options: ConnectOptions,
    pub cancel: Arc<CancelToken>,
    pub tls_spec_index: usize,
    pub is_tls_fallback: bool,
    pub(crate) tunnel_headers: Vec<(String, String)>,
}

impl fmt::Debug for ConnectPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectPlan")
            .field("route", &self.route)
            .field("tls_spec_index", &self.tls_spec_index)
            .field("is_tls_fallback", &self.is_tls_fallback)
            .finish()
    }
}

impl ConnectPlan {
    pub fn new(route: Route, options: ConnectOptions) -> Self {
        ConnectPlan {
            route,
            options,
            cancel: Arc::new(CancelToken::new()),
            tls_spec_index: 0,
            is_tls_fallback: false,
            tunnel_headers: Vec::new(),
        }
    }

    /// Idempotent; safe to call from any thread at any point in the plan's
    /// lifetime, including before the TCP socket exists (§4.4, §5).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Drive the whole state machine: TCP → optional CONNECT tunnel →
    /// optional TLS → `RealConnection`, or a follow-up plan to try next.
    pub async fn connect(mut self) -> Result<ConnectOutcome, Error> {
        let raw = self.connect_tcp().await?;

        let tunneled = if self.needs_tunnel() {
            match self.run_tunnel(raw).await? {
                TunnelOutcome::Established(io) => io,
                TunnelOutcome::FollowUp(plan) => return Ok(ConnectOutcome::FollowUp(plan)),
            }
        } else if matches!(self.route.proxy, Proxy::Socks(_, _)) {
            self.run_socks_handshake(raw).await?
        } else {
            Box::pin(raw) as BoxIo
        };

        self.connect_tls_etc(tunneled).await
    }

    fn needs_tunnel(&self) -> bool {
        matches!(self.route.proxy, Proxy::Http(_, _)) && self.route.address.is_https()
    }

    /// Dials the origin through an already-connected SOCKS5 proxy socket
    /// (§4.4 "SOCKS: via SOCKS-aware socket"). Unlike the HTTP CONNECT
    /// tunnel, this applies to both `http` and `https` origins: SOCKS is a
    /// transport-level relay, not an HTTP intermediary the exchange codec
    /// could otherwise address directly.
    #[cfg(feature = "socks")]
    async fn run_socks_handshake(&self, raw: TcpStream) -> Result<BoxIo, Error> {
        let host = self.route.address.host.to_string();
        let port = self.route.address.port;

        let stream = race_cancel(
            &self.cancel,
            tokio_socks::tcp::Socks5Stream::connect_with_socket(raw, (host.as_str(), port)),
        )
        .await?
        .map_err(Error::tunnel)?
        .into_inner();

        log::debug!("SOCKS5 tunnel established to {host}:{port}");
        Ok(Box::pin(stream) as BoxIo)
    }

    #[cfg(not(feature = "socks"))]
    async fn run_socks_handshake(&self, _raw: TcpStream) -> Result<BoxIo, Error> {
        Err(Error::planning(
            "route requires a SOCKS proxy but this build was compiled without the `socks` feature",
        ))
    }

    async fn connect_tcp(&self) -> Result<TcpStream, Error> {
        if self.is_canceled() {
            return Err(Error::canceled());
        }

        let connect_fut = TcpStream::connect(self.route.socket_addr);
        let stream = match self.options.connect_timeout {
            Some(dur) => race_cancel(&self.cancel, timeout(dur, connect_fut))
                .await?
                .map_err(|_| Error::tcp_connect("connect timed out"))?
                .map_err(Error::tcp_connect)?,
            None => race_cancel(&self.cancel, connect_fut)
                .await?
                .map_err(Error::tcp_connect)?,
        };

        if self.is_canceled() {
            drop(stream);
            return Err(Error::canceled());
        }

        if self.options.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        log::debug!("connected TCP to {}", self.route.socket_addr);
        Ok(stream)
    }

    async fn run_tunnel(&mut self, raw: TcpStream) -> Result<TunnelOutcome, Error> {
        let mut io: BoxIo = Box::pin(raw);
        let host = self.route.address.host.clone();
        let port = self.route.address.port;

        for attempt in 0..MAX_TUNNEL_ATTEMPTS {
            if self.is_canceled() {
                return Err(Error::canceled());
            }

            write_connect_request(&mut io, &host, port, &self.tunnel_headers, &self.options)
                .await
                .map_err(Error::tunnel)?;

            let response = read_connect_response(&mut io)
                .await
                .map_err(Error::tunnel)?;

            match response.status {
                200 => {
                    log::debug!("CONNECT tunnel established to {host}:{port}");
                    return Ok(TunnelOutcome::Established(io));
                }
                407 => {
                    if response.connection_close {
                        // Proxy is closing this socket; a fresh plan must
                        // redial rather than looping on a dead connection
                        // (§4.4).
                        let mut follow_up = self.fresh_follow_up();
                        follow_up.tunnel_headers = self.tunnel_headers.clone();
                        return Ok(TunnelOutcome::FollowUp(follow_up));
                    }

                    let auth = self
                        .route
                        .address
                        .proxy_selector
                        .as_ref()
                        .and_then(|sel| sel.authenticate(&self.route.proxy, response.realm.as_deref()));

                    match auth {
                        Some(ProxyAuth { header_value }) => {
                            self.tunnel_headers
                                .retain(|(k, _)| !k.eq_ignore_ascii_case("proxy-authorization"));
                            self.tunnel_headers
                                .push(("Proxy-Authorization".to_string(), header_value.to_string()));
                            log::debug!("retrying CONNECT tunnel with proxy auth (attempt {attempt})");
                            continue;
                        }
                        None => {
                            return Err(Error::tunnel("proxy authenticator declined 407 challenge"));
                        }
                    }
                }
                status => {
                    return Err(Error::tunnel(format!("unexpected CONNECT response {status}")));
                }
            }
        }

        Err(Error::tunnel("too many proxy authentication attempts"))
    }

    /// A fresh plan for the same route, with TLS state reset — used when
    /// the tunnel auth loop needs to redial after the proxy closes the
    /// socket. Deliberately *not* carrying over `tls_spec_index`/
    /// `is_tls_fallback`: only a TLS handshake failure warrants starting
    /// in fallback mode (see DESIGN.md's Open Question resolution).
    fn fresh_follow_up(&self) -> ConnectPlan {
        ConnectPlan::new(self.route.clone(), self.options.clone())
    }

    async fn connect_tls_etc(mut self, io: BoxIo) -> Result<ConnectOutcome, Error> {
        let Some(tls) = self.route.address.tls.clone() else {
            let protocol = if self
                .route
                .address
                .protocols
                .contains(&Protocol::Http2PriorKnowledge)
            {
                NegotiatedProtocol::Http2
            } else {
                NegotiatedProtocol::Http1_1
            };
            log::debug!("cleartext connection ready, protocol={protocol:?}");
            return Ok(ConnectOutcome::Connection(RealConnection::new(
                self.route, io, protocol, None,
            )));
        };

        let Some(spec) = tls.fallback_sequence.spec_at(self.tls_spec_index) else {
            return Err(Error::tls("TLS fallback sequence exhausted"));
        };

        let alpn = alpn_protocol_list(&self.route.address.protocols);
        let client_config = tls_spec::client_config_for_spec(spec, tls.root_store.clone(), alpn)
            .map_err(Error::tls)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let server_name = match rustls::ServerName::try_from(self.route.address.host.as_ref()) {
            Ok(name) => name,
            Err(e) => return Err(Error::planning(e)),
        };

        log::debug!(
            "starting TLS handshake to {} (spec #{}, fallback={})",
            self.route.address.host,
            self.tls_spec_index,
            self.is_tls_fallback
        );

        let handshake_fut = connector.connect(server_name, io);
        let handshake_result = race_cancel(&self.cancel, handshake_fut).await?;

        let tls_stream = match handshake_result {
            Ok(stream) => stream,
            Err(e) => return self.handle_tls_failure(e),
        };

        let (_, session) = tls_stream.get_ref();
        let negotiated = match session.alpn_protocol() {
            Some(b"h2") => NegotiatedProtocol::Http2,
            _ => NegotiatedProtocol::Http1_1,
        };

        let chain: Vec<Vec<u8>> = session
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.0.clone()).collect())
            .unwrap_or_default();

        if let Some(pinner) = tls.pinner.as_ref() {
            if let Err(e) = pinner.check(&self.route.address.host, &chain) {
                return Err(Error::tls(e));
            }
        }

        log::debug!("TLS handshake complete, negotiated={negotiated:?}");

        let handshake = Handshake {
            negotiated_protocol: negotiated,
            tls_spec_index: self.tls_spec_index,
        };

        Ok(ConnectOutcome::Connection(RealConnection::with_peer_certificates(
            self.route,
            Box::pin(tls_stream),
            negotiated,
            Some(handshake),
            chain,
        )))
    }

    fn handle_tls_failure(self, error: io::Error) -> Result<ConnectOutcome, Error> {
        if !is_retryable_tls_error(&error) {
            return Err(Error::tls(error));
        }

        let tls = self
            .route
            .address
            .tls
            .as_ref()
            .expect("tls_spec_index only set when tls is configured");

        match tls.fallback_sequence.next_compatible(self.tls_spec_index) {
            Some(next_index) => {
                log::debug!("TLS handshake failed, retrying with spec #{next_index}");
                let mut follow_up = ConnectPlan::new(self.route.clone(), self.options.clone());
                follow_up.tls_spec_index = next_index;
                follow_up.is_tls_fallback = true;
                Ok(ConnectOutcome::FollowUp(follow_up))
            }
            None => Err(Error::tls(error)),
        }
    }
}

enum TunnelOutcome {
    Established(BoxIo),
    FollowUp(ConnectPlan),
}

/// §4.5: a TLS failure is retryable with the next `ConnectionSpec` unless
/// it is a timeout (`InterruptedIOException` equivalent), a plain protocol
/// mismatch, or a certificate-validation/hostname-verification failure.
/// `tokio_rustls` surfaces all of these as `io::Error` wrapping an
/// `rustls::Error` via `io::ErrorKind::InvalidData`/`TimedOut`; this
/// inspects the wrapped error to classify it the way the prior art
/// distinguishes `SSLHandshakeException` causes from generic `SSLException`.
fn is_retryable_tls_error(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::TimedOut {
        return false;
    }

    let Some(rustls_err) = error
        .get_ref()
        .and_then(|e| e.downcast_ref::<rustls::Error>())
    else {
        // Not a TLS-protocol-level error (e.g. plain IO failure writing
        // the ClientHello): treat as non-retryable, matching
        // ProtocolException semantics.
        return false;
    };

    // `InvalidCertificate` covers both hostname-verification and
    // certificate-chain validation failures; `General` covers plain
    // protocol mismatches. Both are fatal per §4.5. Anything else (unknown
    // extensions, handshake framing oddities from a legacy-TLS-only peer)
    // is an `SSLException`-equivalent and is retried against the next spec.
    !matches!(
        rustls_err,
        rustls::Error::InvalidCertificate(_) | rustls::Error::General(_)
    )
}

fn alpn_protocol_list(protocols: &[Protocol]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    if protocols.contains(&Protocol::Http2) || protocols.contains(&Protocol::Http2PriorKnowledge) {
        out.push(b"h2".to_vec());
    }
    out.push(b"http/1.1".to_vec());
    out
}

struct TunnelResponse {
    status: u16,
    realm: Option<String>,
    connection_close: bool,
}

/// Emits the exact CONNECT request bytes specified in §6:
/// `CONNECT host:port HTTP/1.1`, `Host`, `Proxy-Connection: Keep-Alive`,
/// `User-Agent` (if configured), then authenticator-supplied headers.
async fn write_connect_request(
    io: &mut BoxIo,
    host: &str,
    port: u16,
    extra_headers: &[(String, String)],
    options: &ConnectOptions,
) -> Result<(), BoxError> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n"
    );

    if let Some(ua) = &options.user_agent {
        request.push_str(&format!("User-Agent: {ua}\r\n"));
    }
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    let write_fut = io.write_all(request.as_bytes());
    match options.write_timeout {
        Some(dur) => timeout(dur, write_fut).await.map_err(|_| "CONNECT write timed out")??,
        None => write_fut.await?,
    };
    Ok(())
}

async fn read_connect_response(io: &mut BoxIo) -> Result<TunnelResponse, BoxError> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err("proxy closed connection during CONNECT".into());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]);
            return parse_connect_response(&head);
        }

        if buf.len() > 64 * 1024 {
            return Err("CONNECT response headers too large".into());
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_connect_response(head: &str) -> Result<TunnelResponse, BoxError> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or("empty CONNECT response")?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or("malformed CONNECT status line")?;

    let mut realm = None;
    let mut connection_close = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("proxy-authenticate") {
            realm = value
                .split("realm=")
                .nth(1)
                .map(|r| r.trim_matches('"').to_string());
        } else if name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("close") {
            connection_close = true;
        }
    }

    Ok(TunnelResponse {
        status,
        realm,
        connection_close,
    })
}

/// Races a connect step against the plan's cancellation: whichever
/// resolves first wins. A cancel that arrives mid-step surfaces as
/// `Error::canceled()` even if the underlying future was about to succeed
/// (§4.3 "cancellation may race arbitrarily").
async fn race_cancel<F, T>(cancel: &CancelToken, fut: F) -> Result<T, Error>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.canceled() => Err(Error::canceled()),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_list_prefers_h2_first() {
        let list = alpn_protocol_list(&[Protocol::Http2, Protocol::Http1_1]);
        assert_eq!(list, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn parse_connect_response_200() {
        let resp = parse_connect_response("HTTP/1.1 200 Connection Established\r\n").unwrap();
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn parse_connect_response_407_with_realm() {
        let resp = parse_connect_response(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\n",
        )
        .unwrap();
        assert_eq!(resp.status, 407);
        assert_eq!(resp.realm.as_deref(), Some("proxy"));
    }

    #[test]
    fn parse_connect_response_detects_connection_close() {
        let resp = parse_connect_response(
            "HTTP/1.1 407 Proxy Authentication Required\r\nConnection: close\r\n",
        )
        .unwrap();
        assert!(resp.connection_close);
    }

    #[tokio::test]
    async fn tunnel_request_bytes_match_wire_format() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut io: BoxIo = Box::pin(stream);
            write_connect_request(&mut io, "example.com", 443, &[], &ConnectOptions::default())
                .await
                .unwrap();
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert_eq!(
            text,
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Connection: Keep-Alive\r\n\r\n"
        );

        writer.await.unwrap();
    }
}
