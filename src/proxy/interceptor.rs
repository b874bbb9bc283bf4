//! The in-process TLS terminator.
//!
//! An internal HTTP/1.1 server reachable only through in-memory pipes handed
//! over by the CONNECT handler. Each pipe arrives with the advertised target
//! host and a leaf certificate already minted for it, so the terminator can
//! complete the TLS handshake immediately and read the plaintext requests
//! inside the tunnel. Every inner request is rewritten to absolute
//! `https://host` form and dispatched through the forward pipeline with the
//! originating connection context, preserving keep-alive for the lifetime of
//! the tunnel.
//!
//! ALPN is pinned to `http/1.1`: allowing h2 here would hand the pipeline
//! framing it does not speak. TLS session secrets are appended to
//! `SSLKEYLOGFILE` when that variable names a writable path.

use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::flow::ConnContext;
use super::pipeline;
use super::server::Shared;
use crate::error::ProxyError;

/// One tunnel handed over by the CONNECT handler.
pub(crate) struct InterceptRequest {
    /// Advertised target, `host:port`.
    pub host: String,
    /// Leaf certificate for the target host.
    pub certified: Arc<CertifiedKey>,
    /// Server end of the in-memory pipe.
    pub io: DuplexStream,
    /// Context of the client connection that owns the tunnel.
    pub conn: Arc<ConnContext>,
}

/// Accept loop over the in-memory listener.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<InterceptRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let host = request.host.clone();
                    if let Err(err) = serve_tunnel(shared, request).await {
                        debug!(host = %host, "intercepted tunnel ended: {err}");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("interceptor stopped");
}

async fn serve_tunnel(shared: Arc<Shared>, request: InterceptRequest) -> Result<(), ProxyError> {
    let InterceptRequest {
        host,
        certified,
        io,
        conn,
    } = request;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(PinnedCertResolver(certified)));
    // Pinned to HTTP/1.1; see the module docs.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.key_log = Arc::new(rustls::KeyLogFile::new());

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let tls = acceptor
        .accept(io)
        .await
        .map_err(|e| ProxyError::Tls(format!("client handshake failed for {host}: {e}")))?;
    conn.client.mark_tls();

    debug!(host = %host, "terminating TLS inside tunnel");

    let service_host = host.clone();
    let service = service_fn(move |req| {
        let shared = Arc::clone(&shared);
        let conn = Arc::clone(&conn);
        let authority = service_host.clone();
        async move {
            Ok::<_, ProxyError>(
                pipeline::run_flow(shared, conn, req, "https".to_string(), authority).await,
            )
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(|e| {
            warn!(host = %host, "intercepted connection error: {e}");
            ProxyError::Http(e)
        })
}

/// Resolver pinned to the tunnel's pre-minted leaf. SNI is ignored: the
/// CONNECT target named the host before the handshake began.
struct PinnedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for PinnedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

impl std::fmt::Debug for PinnedCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedCertResolver").finish_non_exhaustive()
    }
}
