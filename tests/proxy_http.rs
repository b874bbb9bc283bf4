//! End-to-end tests for the plain-HTTP proxy path: addon edits, short
//! circuits, the buffered/streaming body gate, panic containment, and
//! requests addressed to the proxy itself.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use spyglass::{Addon, Flow, FlowResponse, Options, Proxy, ProxyHandle};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Origin server used by the tests.
///
/// - `GET /echo` replies `origin says hi` and mirrors the request's
///   `x-test` header as `x-seen-test`
/// - `POST /collect` replies with the decimal length of the request body
async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_service))
                    .await;
            });
        }
    });
    addr
}

async fn origin_service(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method().clone(), req.uri().path()) {
        (Method::GET, "/echo") => {
            let seen = req.headers().get("x-test").cloned();
            let mut response = Response::new(Full::new(Bytes::from_static(b"origin says hi")));
            if let Some(value) = seen {
                response.headers_mut().insert("x-seen-test", value);
            }
            Ok(response)
        }
        (Method::POST, "/collect") => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Ok(Response::new(Full::new(Bytes::from(body.len().to_string()))))
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

async fn start_proxy(options: Options, configure: impl FnOnce(&mut Proxy)) -> (ProxyHandle, TempDir) {
    let dir = TempDir::new().unwrap();
    let options = options.with_ca_root_path(dir.path());
    let mut proxy = Proxy::new(options).unwrap();
    configure(&mut proxy);
    (proxy.start().await.unwrap(), dir)
}

fn base_options() -> Options {
    Options::new("127.0.0.1:0".parse().unwrap())
}

async fn proxy_sender(
    addr: SocketAddr,
) -> hyper::client::conn::http1::SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(
        TokioIo::new(stream),
    )
    .await
    .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

fn absolute_get(origin: SocketAddr, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(format!("http://{origin}{path}"))
        .header(HOST, origin.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap()
}

struct HeaderTagger;

impl Addon for HeaderTagger {
    fn request_headers(&self, flow: &mut Flow) {
        flow.request.headers.insert("x-test", "1".parse().unwrap());
    }
}

#[tokio::test]
async fn addon_header_edit_reaches_origin() {
    let origin = spawn_origin().await;
    let (handle, _dir) = start_proxy(base_options(), |proxy| {
        proxy.add_addon(Arc::new(HeaderTagger));
    })
    .await;

    let mut sender = proxy_sender(handle.addr()).await;
    let response = timeout(TEST_TIMEOUT, sender.send_request(absolute_get(origin, "/echo")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-seen-test"], "1");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"origin says hi");

    handle.stop().await;
}

struct Teapot;

impl Addon for Teapot {
    fn request_headers(&self, flow: &mut Flow) {
        flow.response = Some(FlowResponse::with_body(StatusCode::IM_A_TEAPOT, "teapot"));
    }
}

#[tokio::test]
async fn short_circuit_never_dials_origin() {
    // 192.0.2.0/24 is TEST-NET-1: a dial would hang, so a prompt answer
    // proves the origin was never contacted.
    let (handle, _dir) = start_proxy(base_options(), |proxy| {
        proxy.add_addon(Arc::new(Teapot));
    })
    .await;

    let mut sender = proxy_sender(handle.addr()).await;
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://192.0.2.1:9/")
        .header(HOST, "192.0.2.1:9")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("short-circuit must not wait on a dial")
        .unwrap();

    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"teapot");

    handle.stop().await;
}

#[derive(Default)]
struct BodyWatcher {
    request_hook: AtomicBool,
    request_modifier: AtomicBool,
}

impl Addon for BodyWatcher {
    fn request(&self, _flow: &mut Flow) {
        self.request_hook.store(true, Ordering::SeqCst);
    }

    fn stream_request_modifier(
        &self,
        _flow: &mut Flow,
        reader: spyglass::BodyReader,
    ) -> spyglass::BodyReader {
        self.request_modifier.store(true, Ordering::SeqCst);
        reader
    }
}

#[tokio::test]
async fn large_body_streams_past_the_request_hook() {
    let origin = spawn_origin().await;
    let watcher = Arc::new(BodyWatcher::default());
    let watcher_ref = Arc::clone(&watcher);
    let (handle, _dir) = start_proxy(base_options().with_stream_large_bodies(1024), move |proxy| {
        proxy.add_addon(watcher_ref);
    })
    .await;

    let mut sender = proxy_sender(handle.addr()).await;
    let payload = Bytes::from(vec![0x41u8; 4096]);
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{origin}/collect"))
        .header(HOST, origin.to_string())
        .body(Full::new(payload))
        .unwrap();

    let response = timeout(TEST_TIMEOUT, sender.send_request(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"4096", "origin must receive every byte");

    assert!(
        !watcher.request_hook.load(Ordering::SeqCst),
        "request hook must not fire for streamed bodies"
    );
    assert!(
        watcher.request_modifier.load(Ordering::SeqCst),
        "stream modifier must fire for streamed bodies"
    );

    handle.stop().await;
}

#[tokio::test]
async fn small_body_is_buffered_and_hook_fires() {
    let origin = spawn_origin().await;
    let watcher = Arc::new(BodyWatcher::default());
    let watcher_ref = Arc::clone(&watcher);
    let (handle, _dir) = start_proxy(base_options().with_stream_large_bodies(1024), move |proxy| {
        proxy.add_addon(watcher_ref);
    })
    .await;

    let mut sender = proxy_sender(handle.addr()).await;
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{origin}/collect"))
        .header(HOST, origin.to_string())
        .body(Full::new(Bytes::from_static(b"small payload")))
        .unwrap();

    let response = timeout(TEST_TIMEOUT, sender.send_request(request))
        .await
        .unwrap()
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"13");
    assert!(watcher.request_hook.load(Ordering::SeqCst));

    handle.stop().await;
}

struct Panicker;

impl Addon for Panicker {
    fn request_headers(&self, flow: &mut Flow) {
        if flow.request.url.path_and_query.starts_with("/boom") {
            panic!("addon exploded");
        }
    }
}

#[tokio::test]
async fn addon_panic_yields_502_and_proxy_survives() {
    let origin = spawn_origin().await;
    let (handle, _dir) = start_proxy(base_options(), |proxy| {
        proxy.add_addon(Arc::new(Panicker));
    })
    .await;

    let mut sender = proxy_sender(handle.addr()).await;
    let response = timeout(TEST_TIMEOUT, sender.send_request(absolute_get(origin, "/boom")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // The proxy keeps serving; a clean request on a fresh connection works.
    let mut sender = proxy_sender(handle.addr()).await;
    let response = timeout(TEST_TIMEOUT, sender.send_request(absolute_get(origin, "/echo")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    handle.stop().await;
}

#[tokio::test]
async fn keep_alive_serves_sequential_flows() {
    let origin = spawn_origin().await;
    let (handle, _dir) = start_proxy(base_options(), |_| {}).await;

    let mut sender = proxy_sender(handle.addr()).await;
    for _ in 0..3 {
        sender.ready().await.unwrap();
        let response = timeout(TEST_TIMEOUT, sender.send_request(absolute_get(origin, "/echo")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"origin says hi");
    }

    handle.stop().await;
}

#[tokio::test]
async fn relative_request_gets_400() {
    let (handle, _dir) = start_proxy(base_options(), |_| {}).await;

    let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: whatever\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 400"), "got: {text}");
    assert!(text.contains("proxy server"));

    handle.stop().await;
}

struct Panel;

impl Addon for Panel {
    fn access_proxy_server(
        &self,
        req: &Request<Incoming>,
    ) -> Option<Response<spyglass::ProxyBody>> {
        if req.uri().path() == "/panel" {
            Some(
                Response::builder()
                    .status(StatusCode::OK)
                    .body(spyglass::proxy::body::full_body("panel here"))
                    .unwrap(),
            )
        } else {
            None
        }
    }
}

#[tokio::test]
async fn addon_owns_direct_requests() {
    let (handle, _dir) = start_proxy(base_options(), |proxy| {
        proxy.add_addon(Arc::new(Panel));
    })
    .await;

    let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
    stream
        .write_all(b"GET /panel HTTP/1.1\r\nHost: whatever\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.contains("panel here"));

    handle.stop().await;
}
