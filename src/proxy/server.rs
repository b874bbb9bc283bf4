//! The proxy server: listeners, dispatcher, and lifecycle.
//!
//! [`Proxy`] is the embedder-facing entry point. Configure it with
//! [`Options`], register addons, then either [`run`](Proxy::run) it in place
//! or [`start`](Proxy::start) it in the background and drive it through the
//! returned [`ProxyHandle`].
//!
//! # Architecture
//!
//! One tokio task per accepted client connection, serving HTTP/1.1 with
//! upgrade support for CONNECT. The dispatcher branches per request:
//! CONNECT goes to the tunnel handler, absolute-URI requests go through the
//! forward pipeline, and relative-URI requests are treated as addressed to
//! the proxy itself. The in-process interceptor and the optional SOCKS5
//! front-end run as sibling tasks sharing the same [`Shared`] state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::addon::{contained, fire_conn_hook, Addon};
use super::body::{full_body, ProxyBody};
use super::connect;
use super::flow::ConnContext;
use super::interceptor::{self, InterceptRequest};
use super::outbound::{build_client_tls, OriginConn, OriginKey};
use super::pipeline::{self, bad_gateway};
use super::socks;
use super::upstream::{self, UpstreamAddr, UpstreamFn};
use crate::ca::{CertAuthority, CertStore};
use crate::error::ProxyError;
use crate::options::Options;

/// Reply body for requests addressed directly to the proxy when no addon
/// claims them.
const DIRECT_REQUEST_MESSAGE: &str =
    "This is a proxy server; it does not serve requests directly.";

/// Per-request intercept decision. Receives the CONNECT authority
/// (`host:port`).
pub type InterceptFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// State shared by the dispatcher, the interceptor, and the outbound layer.
pub(crate) struct Shared {
    pub options: Options,
    pub addons: Vec<Arc<dyn Addon>>,
    pub cert_store: CertStore,
    pub intercept_rule: Option<InterceptFn>,
    pub upstream_fn: Option<UpstreamFn>,
    pub intercept_tx: mpsc::Sender<InterceptRequest>,
    pub pool: Mutex<HashMap<OriginKey, OriginConn>>,
    tls_secure: Arc<rustls::ClientConfig>,
    tls_insecure: Arc<rustls::ClientConfig>,
}

impl Shared {
    pub(crate) fn should_intercept(&self, authority: &str) -> bool {
        self.intercept_rule
            .as_ref()
            .map(|rule| rule(authority))
            .unwrap_or(true)
    }

    pub(crate) fn resolve_upstream(&self, host: &str) -> Result<Option<UpstreamAddr>, ProxyError> {
        upstream::resolve(
            self.upstream_fn.as_ref(),
            self.options.upstream.as_deref(),
            host,
        )
    }

    /// The outbound TLS client config for this proxy's verification policy.
    pub(crate) fn client_tls(&self) -> Arc<rustls::ClientConfig> {
        if self.options.ssl_insecure {
            Arc::clone(&self.tls_insecure)
        } else {
            Arc::clone(&self.tls_secure)
        }
    }
}

/// An intercepting HTTP/HTTPS forward proxy.
pub struct Proxy {
    options: Options,
    addons: Vec<Arc<dyn Addon>>,
    cert_store: CertStore,
    intercept_rule: Option<InterceptFn>,
    upstream_fn: Option<UpstreamFn>,
}

impl Proxy {
    /// Creates a proxy, loading (or generating) the root CA under
    /// `options.ca_root_path`.
    pub fn new(options: Options) -> Result<Self, ProxyError> {
        let authority = CertAuthority::load_or_generate(&options.ca_root_path)?;
        Ok(Self {
            options,
            addons: Vec::new(),
            cert_store: CertStore::new(authority),
            intercept_rule: None,
            upstream_fn: None,
        })
    }

    /// Registers an addon. Addons are invoked in registration order at every
    /// hook.
    pub fn add_addon(&mut self, addon: Arc<dyn Addon>) {
        self.addons.push(addon);
    }

    /// Overrides the per-CONNECT intercept decision (default: intercept
    /// everything).
    pub fn set_should_intercept(&mut self, rule: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.intercept_rule = Some(Arc::new(rule));
    }

    /// Installs a per-request upstream selector. When installed it is
    /// authoritative: returning `None` selects a direct connection.
    pub fn set_upstream_proxy(
        &mut self,
        selector: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) {
        self.upstream_fn = Some(Arc::new(selector));
    }

    /// The root CA certificate in PEM form, for installing into client trust
    /// stores.
    pub fn root_cert_pem(&self) -> &str {
        self.cert_store.authority().cert_pem()
    }

    /// The root CA certificate in DER form.
    pub fn root_cert_der(&self) -> &[u8] {
        self.cert_store.authority().cert_der().as_ref()
    }

    /// Binds the listeners and runs until externally terminated.
    pub async fn run(self) -> Result<(), ProxyError> {
        let handle = self.start().await?;
        handle.wait().await;
        Ok(())
    }

    /// Binds the listeners and spawns the proxy in the background.
    ///
    /// A SOCKS5 bind failure is logged and disables only the SOCKS5
    /// front-end; a failure to bind the HTTP listener is fatal.
    pub async fn start(self) -> Result<ProxyHandle, ProxyError> {
        let listener = TcpListener::bind(self.options.http_addr).await?;
        let http_addr = listener.local_addr()?;

        let socks_listener = match self.options.socks_addr {
            Some(addr) => match TcpListener::bind(addr).await {
                Ok(l) => Some(l),
                Err(err) => {
                    warn!(%addr, "SOCKS5 bind failed, front-end disabled: {err}");
                    None
                }
            },
            None => None,
        };
        let socks_addr = socks_listener.as_ref().and_then(|l| l.local_addr().ok());

        let root_pem = self.cert_store.authority().cert_pem().to_string();
        let root_der = self.cert_store.authority().cert_der().as_ref().to_vec();

        let (intercept_tx, intercept_rx) = mpsc::channel(32);
        let (drain_tx, drain_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));

        let shared = Arc::new(Shared {
            tls_secure: Arc::new(build_client_tls(false)),
            tls_insecure: Arc::new(build_client_tls(true)),
            options: self.options,
            addons: self.addons,
            cert_store: self.cert_store,
            intercept_rule: self.intercept_rule,
            upstream_fn: self.upstream_fn,
            intercept_tx,
            pool: Mutex::new(HashMap::new()),
        });

        tokio::spawn(interceptor::run(
            Arc::clone(&shared),
            intercept_rx,
            abort_rx.clone(),
        ));

        if let Some(listener) = socks_listener {
            info!(addr = %socks_addr.unwrap(), "SOCKS5 front-end listening");
            tokio::spawn(socks::run(listener, http_addr, drain_rx.clone()));
        }

        info!(addr = %http_addr, "http proxy listening");
        let task = tokio::spawn(accept_loop(
            Arc::clone(&shared),
            listener,
            drain_rx,
            abort_rx,
            Arc::clone(&active),
        ));

        Ok(ProxyHandle {
            http_addr,
            socks_addr,
            drain_tx,
            abort_tx,
            active,
            task,
            root_pem,
            root_der,
        })
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("options", &self.options)
            .field("addons", &self.addons.len())
            .finish_non_exhaustive()
    }
}

/// Handle to a running proxy.
pub struct ProxyHandle {
    http_addr: SocketAddr,
    socks_addr: Option<SocketAddr>,
    drain_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
    root_pem: String,
    root_der: Vec<u8>,
}

impl ProxyHandle {
    /// Address of the HTTP listener (useful with port 0).
    pub fn addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Address of the SOCKS5 listener, when enabled and bound.
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_addr
    }

    /// The root CA certificate in PEM form.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_pem
    }

    /// The root CA certificate in DER form.
    pub fn root_cert_der(&self) -> &[u8] {
        &self.root_der
    }

    /// Stops accepting new connections; in-flight connections continue.
    pub fn shutdown(&self) {
        let _ = self.drain_tx.send(true);
    }

    /// Stops accepting and tears down in-flight connections.
    pub fn close(&self) {
        let _ = self.drain_tx.send(true);
        let _ = self.abort_tx.send(true);
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.task.await;
    }

    /// Immediate shutdown: close everything and wait.
    pub async fn stop(self) {
        self.close();
        self.wait().await;
    }

    /// Graceful shutdown: stop accepting, wait for in-flight connections to
    /// drain up to `timeout`, then force-close the rest.
    pub async fn shutdown_graceful(self, timeout: Duration) {
        self.shutdown();
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.stop().await;
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut drain: watch::Receiver<bool>,
    abort: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&shared);
                        let abort = abort.clone();
                        let guard = ActiveGuard::new(Arc::clone(&active));
                        tokio::spawn(async move {
                            handle_client(shared, stream, peer, abort).await;
                            drop(guard);
                        });
                    }
                    Err(err) => warn!("accept error: {err}"),
                }
            }
            changed = drain.changed() => {
                if changed.is_err() || *drain.borrow() {
                    break;
                }
            }
        }
    }
    info!("http proxy stopped accepting");
}

async fn handle_client(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    mut abort: watch::Receiver<bool>,
) {
    let conn = Arc::new(ConnContext::new(peer));
    fire_conn_hook(&shared.addons, "client_connected", |a| {
        a.client_connected(&conn.client)
    });

    let svc_shared = Arc::clone(&shared);
    let svc_conn = Arc::clone(&conn);
    let service = service_fn(move |req| {
        dispatch(Arc::clone(&svc_shared), Arc::clone(&svc_conn), req)
    });

    let serve = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();

    let aborted = tokio::select! {
        result = serve => {
            if let Err(err) = result {
                debug!(%peer, "connection ended: {err}");
            }
            false
        }
        _ = wait_abort(&mut abort) => {
            debug!(%peer, "connection aborted by shutdown");
            true
        }
    };

    // A CONNECT tunnel outlives the serve future; wait for it so the
    // disconnect hook fires after the last flow hook.
    let tunnel = conn
        .tunnel_task
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(task) = tunnel {
        if aborted {
            task.abort();
        }
        let _ = task.await;
    }

    // Dropping the keep-alive origin connection lets its driver task fire
    // server_disconnected.
    conn.server_conn.lock().await.take();

    fire_conn_hook(&shared.addons, "client_disconnected", |a| {
        a.client_disconnected(&conn.client)
    });
}

async fn wait_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without aborting; never fire.
            std::future::pending::<()>().await;
        }
    }
}

/// Routes one inbound request.
async fn dispatch(
    shared: Arc<Shared>,
    conn: Arc<ConnContext>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        return connect::handle_connect(shared, conn, req).await;
    }

    let target = match (req.uri().scheme_str(), req.uri().authority()) {
        (Some(scheme), Some(authority)) => (scheme.to_string(), authority.to_string()),
        _ => {
            // Addressed at the proxy itself: the first addon that claims the
            // request owns the response.
            for addon in &shared.addons {
                match contained("access_proxy_server", || addon.access_proxy_server(&req)) {
                    Ok(Some(response)) => return Ok(response),
                    Ok(None) => {}
                    Err(_) => return Ok(bad_gateway()),
                }
            }
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(full_body(DIRECT_REQUEST_MESSAGE))
                .unwrap());
        }
    };

    Ok(pipeline::run_flow(shared, conn, req, target.0, target.1).await)
}
