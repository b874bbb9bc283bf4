//! End-to-end tests for CONNECT handling: HTTPS interception with a client
//! that trusts the proxy's root, blind transponding, and the SOCKS5
//! front-end feeding the same pipeline.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use spyglass::{Addon, Flow, Options, Proxy, ProxyHandle};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTPS origin with a self-signed certificate for 127.0.0.1.
/// `GET /secret` replies `secret data`.
async fn spawn_tls_origin() -> SocketAddr {
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap()));
    let cert = params.self_signed(&key).unwrap();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(secret_service))
                    .await;
            });
        }
    });
    addr
}

async fn secret_service(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == "/secret" {
        Ok(Response::new(Full::new(Bytes::from_static(b"secret data"))))
    } else {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::NOT_FOUND;
        Ok(response)
    }
}

/// Plain-HTTP origin replying `plain reply` on any path.
async fn spawn_plain_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(|_req| async {
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                                b"plain reply",
                            ))))
                        }),
                    )
                    .await;
            });
        }
    });
    addr
}

async fn start_proxy(configure: impl FnOnce(&mut Proxy)) -> (ProxyHandle, TempDir) {
    let dir = TempDir::new().unwrap();
    let options = Options::new("127.0.0.1:0".parse().unwrap())
        .with_socks_addr("127.0.0.1:0".parse().unwrap())
        .with_ssl_insecure(true)
        .with_ca_root_path(dir.path());
    let mut proxy = Proxy::new(options).unwrap();
    configure(&mut proxy);
    (proxy.start().await.unwrap(), dir)
}

/// Reads an HTTP response head (through the blank line) from a raw stream.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        assert!(head.len() < 16 * 1024, "oversized response head");
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed while reading head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Issues a CONNECT on a fresh stream to the proxy and returns the tunnel.
async fn open_tunnel(proxy_addr: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.contains(" 200 "), "CONNECT refused: {head}");
    stream
}

/// Performs the client side of an intercepted HTTPS exchange over `stream`:
/// TLS trusting `root_der`, then `GET /secret` with the given authority.
async fn tls_roundtrip<S>(stream: S, authority: String, root_der: &[u8]) -> (StatusCode, Bytes)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(root_der.to_vec()))
        .expect("proxy root must parse");
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
    let tls = connector
        .connect(server_name, stream)
        .await
        .expect("client must accept the forged leaf");

    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(tls))
            .await
            .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri("/secret")
        .header(HOST, authority)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[derive(Default)]
struct UrlRecorder {
    urls: Mutex<Vec<String>>,
}

impl Addon for UrlRecorder {
    fn request_headers(&self, flow: &mut Flow) {
        self.urls
            .lock()
            .unwrap()
            .push(flow.request.url.to_string());
    }
}

#[tokio::test]
async fn https_interception_round_trip() {
    let origin = spawn_tls_origin().await;
    let recorder = Arc::new(UrlRecorder::default());
    let recorder_ref = Arc::clone(&recorder);
    let (handle, _dir) = start_proxy(move |proxy| {
        proxy.add_addon(recorder_ref);
    })
    .await;

    let result = timeout(TEST_TIMEOUT, async {
        let tunnel = open_tunnel(handle.addr(), origin).await;
        tls_roundtrip(tunnel, origin.to_string(), handle.root_cert_der()).await
    })
    .await
    .unwrap();

    assert_eq!(result.0, StatusCode::OK);
    assert_eq!(&result.1[..], b"secret data");

    // The addon observed the decrypted inner request with an https URL.
    let urls = recorder.urls.lock().unwrap().clone();
    assert!(
        urls.iter().any(|u| u == &format!("https://{origin}/secret")),
        "addon saw: {urls:?}"
    );

    handle.stop().await;
}

#[tokio::test]
async fn transpond_relays_bytes_untouched() {
    let origin = spawn_plain_origin().await;
    let (handle, _dir) = start_proxy(|proxy| {
        proxy.set_should_intercept(|_| false);
    })
    .await;

    let result = timeout(TEST_TIMEOUT, async {
        let mut tunnel = open_tunnel(handle.addr(), origin).await;
        tunnel
            .write_all(
                format!("GET /anything HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut raw = Vec::new();
        tunnel.read_to_end(&mut raw).await.unwrap();
        String::from_utf8_lossy(&raw).to_string()
    })
    .await
    .unwrap();

    assert!(result.starts_with("HTTP/1.1 200"), "got: {result}");
    assert!(result.contains("plain reply"));

    handle.stop().await;
}

/// SOCKS5 client handshake for a CONNECT to an IPv4 target.
async fn socks5_connect(socks_addr: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(socks_addr).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00], "method negotiation failed");

    let std::net::IpAddr::V4(ip) = target.ip() else {
        panic!("test target must be IPv4");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "SOCKS5 request failed with code {}", reply[1]);
    stream
}

#[tokio::test]
async fn socks5_front_end_drives_interception() {
    let origin = spawn_tls_origin().await;
    let recorder = Arc::new(UrlRecorder::default());
    let recorder_ref = Arc::clone(&recorder);
    let (handle, _dir) = start_proxy(move |proxy| {
        proxy.add_addon(recorder_ref);
    })
    .await;
    let socks_addr = handle.socks_addr().expect("SOCKS5 front-end must be up");

    let result = timeout(TEST_TIMEOUT, async {
        let tunnel = socks5_connect(socks_addr, origin).await;
        tls_roundtrip(tunnel, origin.to_string(), handle.root_cert_der()).await
    })
    .await
    .unwrap();

    assert_eq!(result.0, StatusCode::OK);
    assert_eq!(&result.1[..], b"secret data");

    // Same intercepted flow as the plain CONNECT path, leaf issuance
    // included.
    let urls = recorder.urls.lock().unwrap().clone();
    assert!(
        urls.iter().any(|u| u.contains("/secret")),
        "addon saw: {urls:?}"
    );

    handle.stop().await;
}

#[tokio::test]
async fn connect_to_unreachable_target_is_502() {
    let (handle, _dir) = start_proxy(|proxy| {
        proxy.set_should_intercept(|_| false);
    })
    .await;

    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        // Port 1 on loopback: immediate connection refused.
        stream
            .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
            .await
            .unwrap();
        read_head(&mut stream).await
    })
    .await
    .unwrap();

    assert!(result.contains(" 502 "), "got: {result}");

    handle.stop().await;
}
