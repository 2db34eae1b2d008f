//! End-to-end `ConnectPlan` behavior against a loopback proxy: the CONNECT
//! tunnel authentication retry loop (407 -> retry with credentials -> 200).

use std::sync::Arc;

use fastconnect::{
    address::{AddressKey, Scheme},
    connect_plan::{ConnectOptions, ConnectOutcome, ConnectPlan},
    dns::GaiResolver,
    error::BoxError,
    proxy::{Proxy, ProxyAuth, ProxySelector},
    route::Route,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// Always supplies the same Basic credential for any 407 challenge.
struct FixedAuthenticator;
impl ProxySelector for FixedAuthenticator {
    fn select(&self, _scheme: &str, _host: &str) -> Result<Vec<Proxy>, BoxError> {
        Ok(vec![Proxy::Direct])
    }

    fn authenticate(&self, _proxy: &Proxy, _realm: Option<&str>) -> Option<ProxyAuth> {
        Some(ProxyAuth {
            header_value: Arc::from("Basic dXNlcjpwYXNz"),
        })
    }
}

async fn read_request(io: &mut tokio::net::TcpStream) -> String {
    let mut buf = vec![0u8; 1024];
    let mut total = Vec::new();
    loop {
        let n = io.read(&mut buf).await.unwrap();
        total.extend_from_slice(&buf[..n]);
        if total.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&total).into_owned()
}

#[tokio::test]
async fn connect_plan_retries_the_tunnel_after_a_407_challenge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut io, _) = listener.accept().await.unwrap();

        let first = read_request(&mut io).await;
        assert!(first.starts_with("CONNECT example.test:443 HTTP/1.1"));
        assert!(!first.to_ascii_lowercase().contains("proxy-authorization"));
        io.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n")
            .await
            .unwrap();

        let second = read_request(&mut io).await;
        assert!(second.to_ascii_lowercase().contains("proxy-authorization: basic dxnlcjpwyxnz"));
        io.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();
    });

    let address = AddressKey::new(Scheme::Https, "example.test", 443, Arc::new(GaiResolver::new()))
        .with_proxy_selector(Arc::new(FixedAuthenticator));
    let route = Route::new(
        address,
        Proxy::Http(Arc::from("proxy.test"), proxy_addr.port()),
        proxy_addr,
    );
    let plan = ConnectPlan::new(route, ConnectOptions::default());

    let outcome = plan.connect().await.expect("tunnel should establish after retrying auth");
    assert!(matches!(outcome, ConnectOutcome::Connection(_)));

    server.await.unwrap();
}

#[cfg(feature = "socks")]
#[tokio::test]
async fn connect_plan_dials_the_origin_through_a_socks5_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut io, _) = listener.accept().await.unwrap();

        // Method negotiation: client offers methods, server picks "no auth".
        let mut greeting = [0u8; 2];
        io.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[0], 0x05);
        let nmethods = greeting[1] as usize;
        let mut methods = vec![0u8; nmethods];
        io.read_exact(&mut methods).await.unwrap();
        io.write_all(&[0x05, 0x00]).await.unwrap();

        // CONNECT request: VER CMD RSV ATYP DST.ADDR DST.PORT
        let mut head = [0u8; 4];
        io.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x05);
        assert_eq!(head[1], 0x01, "expected a CONNECT command");
        let host = match head[3] {
            0x03 => {
                let mut len = [0u8; 1];
                io.read_exact(&mut len).await.unwrap();
                let mut name = vec![0u8; len[0] as usize];
                io.read_exact(&mut name).await.unwrap();
                String::from_utf8(name).unwrap()
            }
            other => panic!("unexpected address type {other}"),
        };
        let mut port = [0u8; 2];
        io.read_exact(&mut port).await.unwrap();
        assert_eq!(host, "example.test");
        assert_eq!(u16::from_be_bytes(port), 80);

        io.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    });

    let address = AddressKey::new(Scheme::Http, "example.test", 80, Arc::new(GaiResolver::new()));
    let route = Route::new(
        address,
        Proxy::Socks(Arc::from("proxy.test"), proxy_addr.port()),
        proxy_addr,
    );
    let plan = ConnectPlan::new(route, ConnectOptions::default());

    let outcome = plan.connect().await.expect("SOCKS5 handshake should succeed");
    assert!(matches!(outcome, ConnectOutcome::Connection(_)));

    server.await.unwrap();
}

#[cfg(not(feature = "socks"))]
#[tokio::test]
async fn socks_route_fails_clearly_when_the_feature_is_not_enabled() {
    let address = AddressKey::new(Scheme::Http, "example.test", 80, Arc::new(GaiResolver::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let route = Route::new(
        address,
        Proxy::Socks(Arc::from("proxy.test"), proxy_addr.port()),
        proxy_addr,
    );
    let plan = ConnectPlan::new(route, ConnectOptions::default());

    let err = plan.connect().await.unwrap_err();
    assert!(!err.is_canceled());
}

#[tokio::test]
async fn proxy_closing_the_socket_on_407_yields_a_fresh_follow_up_plan() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut io, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut io).await;
        io.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
    });

    let address = AddressKey::new(Scheme::Https, "example.test", 443, Arc::new(GaiResolver::new()))
        .with_proxy_selector(Arc::new(FixedAuthenticator));
    let route = Route::new(
        address,
        Proxy::Http(Arc::from("proxy.test"), proxy_addr.port()),
        proxy_addr,
    );
    let plan = ConnectPlan::new(route, ConnectOptions::default());

    let outcome = plan.connect().await.expect("a closed tunnel socket should yield a follow-up, not an error");
    assert!(matches!(outcome, ConnectOutcome::FollowUp(_)));

    server.await.unwrap();
}
