//! Outbound HTTP client plumbing.
//!
//! Two client paths reach an origin:
//!
//! - the **keep-alive client** owned by a [`ConnContext`], reused by
//!   consecutive flows on the same client connection;
//! - the **separate pooled client**, shared proxy-wide, used when a flow
//!   sets `use_separate_client` or when addons rewrote the target
//!   scheme/host.
//!
//! Both paths speak HTTP/1.1 only, never follow redirects (a `3xx` is a
//! response like any other here), and never decompress: the client must see
//! the origin's original encoding. Dials honor the upstream resolver; TLS
//! uses the system trust store unless `ssl_insecure` is set, and appends
//! session secrets to `SSLKEYLOGFILE` when that is configured.

use std::sync::Arc;

use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HeaderValue, HOST};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use super::addon::fire_conn_hook;
use super::body::ProxyBody;
use super::flow::{ConnContext, RequestUrl};
use super::server::Shared;
use super::upstream::UpstreamAddr;
use crate::error::ProxyError;

/// Target scheme of an origin connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TargetScheme {
    Http,
    Https,
}

impl TargetScheme {
    fn default_port(self) -> u16 {
        match self {
            TargetScheme::Http => 80,
            TargetScheme::Https => 443,
        }
    }
}

/// Identity of an origin connection: scheme plus `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OriginKey {
    pub scheme: TargetScheme,
    /// Always carries an explicit port.
    pub authority: String,
}

impl OriginKey {
    pub(crate) fn from_url(url: &RequestUrl) -> Result<Self, ProxyError> {
        let scheme = match url.scheme.as_str() {
            "http" => TargetScheme::Http,
            "https" => TargetScheme::Https,
            other => {
                return Err(ProxyError::InvalidRequest(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        Ok(Self {
            scheme,
            authority: with_default_port(&url.authority, scheme.default_port()),
        })
    }

    fn host(&self) -> &str {
        super::flow::host_of(&self.authority)
    }
}

/// Appends the default port when the authority has none.
pub(crate) fn with_default_port(authority: &str, default_port: u16) -> String {
    let has_port = if let Some(rest) = authority.strip_prefix('[') {
        rest.find(']')
            .is_some_and(|end| rest[end + 1..].starts_with(':'))
    } else {
        matches!(authority.rsplit_once(':'), Some((host, port))
            if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty())
    };
    if has_port {
        authority.to_string()
    } else if authority.contains(':') && !authority.starts_with('[') {
        // bare IPv6 literal
        format!("[{authority}]:{default_port}")
    } else {
        format!("{authority}:{default_port}")
    }
}

/// A live origin connection owned by a [`ConnContext`].
pub(crate) struct OriginConn {
    pub key: OriginKey,
    pub sender: SendRequest<ProxyBody>,
    /// Requests must use the absolute-form request target (plain HTTP
    /// forwarded through an HTTP upstream proxy).
    pub absolute_form: bool,
}

impl std::fmt::Debug for OriginConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginConn")
            .field("key", &self.key)
            .field("absolute_form", &self.absolute_form)
            .finish()
    }
}

/// Sends a request to the origin through the keep-alive client of `conn`,
/// dialing or re-dialing as needed.
pub(crate) async fn send_keepalive(
    shared: &Arc<Shared>,
    conn: &Arc<ConnContext>,
    key: OriginKey,
    method: &Method,
    url: &RequestUrl,
    headers: HeaderMap,
    body: ProxyBody,
) -> Result<Response<Incoming>, ProxyError> {
    let mut slot = conn.server_conn.lock().await;

    let reusable = matches!(&*slot, Some(c) if c.key == key && !c.sender.is_closed());
    if !reusable {
        // Dropping the stale sender lets its driver task wind down and fire
        // server_disconnected.
        slot.take();
        *slot = Some(dial(shared, &key, Some(conn)).await?);
    }

    let origin = slot.as_mut().unwrap();
    let req = assemble_request(method, url, headers, body, origin.absolute_form)?;
    origin.sender.ready().await?;
    Ok(origin.sender.send_request(req).await?)
}

/// Sends a request through the shared connection pool.
pub(crate) async fn send_separate(
    shared: &Arc<Shared>,
    key: OriginKey,
    method: &Method,
    url: &RequestUrl,
    headers: HeaderMap,
    body: ProxyBody,
) -> Result<Response<Incoming>, ProxyError> {
    let pooled = {
        let mut pool = shared.pool.lock().await;
        pool.remove(&key)
    };

    let mut origin = match pooled {
        Some(mut origin) if !origin.sender.is_closed() => {
            if origin.sender.ready().await.is_ok() {
                debug!(authority = %key.authority, "reusing pooled origin connection");
                origin
            } else {
                dial(shared, &key, None).await?
            }
        }
        _ => dial(shared, &key, None).await?,
    };

    let req = assemble_request(method, url, headers, body, origin.absolute_form)?;
    let response = origin.sender.send_request(req).await?;

    if !origin.sender.is_closed() {
        let mut pool = shared.pool.lock().await;
        pool.insert(key, origin);
    }
    Ok(response)
}

fn assemble_request(
    method: &Method,
    url: &RequestUrl,
    headers: HeaderMap,
    body: ProxyBody,
    absolute_form: bool,
) -> Result<Request<ProxyBody>, ProxyError> {
    let uri: Uri = if absolute_form {
        url.to_string()
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad target URL: {e}")))?
    } else {
        let pq = if url.path_and_query.is_empty() {
            "/"
        } else {
            url.path_and_query.as_str()
        };
        pq.parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad request path: {e}")))?
    };

    let mut req = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(body)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    *req.headers_mut() = headers;
    req.headers_mut().insert(
        HOST,
        HeaderValue::from_str(&url.authority)
            .map_err(|e| ProxyError::InvalidRequest(format!("bad authority: {e}")))?,
    );
    Ok(req)
}

/// Dials an origin, possibly through an upstream proxy, and performs the
/// HTTP/1.1 handshake. `conn` is set on the keep-alive path and drives the
/// `server_connected`/`tls_established_server`/`server_disconnected` hooks.
async fn dial(
    shared: &Arc<Shared>,
    key: &OriginKey,
    conn: Option<&Arc<ConnContext>>,
) -> Result<OriginConn, ProxyError> {
    let (stream, absolute_form) = dial_stream(shared, key).await?;

    let sender = match key.scheme {
        TargetScheme::Http => establish(shared, conn, stream).await?,
        TargetScheme::Https => {
            let server_name = server_name_of(key.host())?;
            let connector = TlsConnector::from(shared.client_tls());
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProxyError::Tls(format!("origin handshake failed: {e}")))?;
            if let Some(ctx) = conn {
                fire_conn_hook(&shared.addons, "tls_established_server", |a| {
                    a.tls_established_server(ctx)
                });
            }
            establish(shared, conn, tls).await?
        }
    };

    debug!(authority = %key.authority, ?key.scheme, "origin connection established");

    Ok(OriginConn {
        key: key.clone(),
        sender,
        absolute_form,
    })
}

/// Opens the transport-level stream to the origin or its upstream. The flag
/// says whether requests must use absolute-form targets.
async fn dial_stream(
    shared: &Arc<Shared>,
    key: &OriginKey,
) -> Result<(TcpStream, bool), ProxyError> {
    let upstream = shared.resolve_upstream(key.host())?;
    match upstream {
        None => {
            let stream = TcpStream::connect(&key.authority)
                .await
                .map_err(|e| connect_err(&key.authority, e))?;
            Ok((stream, false))
        }
        Some(UpstreamAddr::Http(proxy_addr)) => {
            let mut stream = TcpStream::connect(&proxy_addr)
                .await
                .map_err(|e| connect_err(&proxy_addr, e))?;
            match key.scheme {
                // TLS targets tunnel through the proxy.
                TargetScheme::Https => {
                    http_connect_handshake(&mut stream, &key.authority).await?;
                    Ok((stream, false))
                }
                // Plain HTTP is forwarded with absolute-form targets.
                TargetScheme::Http => Ok((stream, true)),
            }
        }
        Some(UpstreamAddr::Socks(proxy_addr)) => {
            let stream = Socks5Stream::connect(proxy_addr.as_str(), key.authority.as_str())
                .await
                .map_err(|e| ProxyError::Connect {
                    addr: proxy_addr.clone(),
                    message: format!("SOCKS5 upstream: {e}"),
                })?;
            Ok((stream.into_inner(), false))
        }
    }
}

async fn establish<T>(
    shared: &Arc<Shared>,
    conn: Option<&Arc<ConnContext>>,
    io: T,
) -> Result<SendRequest<ProxyBody>, ProxyError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake::<_, ProxyBody>(TokioIo::new(io))
        .await?;

    let hook_state = conn.map(|ctx| (shared.addons.clone(), Arc::clone(ctx)));
    if let Some((addons, ctx)) = &hook_state {
        fire_conn_hook(addons, "server_connected", |a| a.server_connected(ctx));
    }

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("origin connection ended: {err}");
        }
        if let Some((addons, ctx)) = hook_state {
            fire_conn_hook(&addons, "server_disconnected", |a| {
                a.server_disconnected(&ctx)
            });
        }
    });

    Ok(sender)
}

/// Opens a raw tunnel stream for the CONNECT transpond path: direct to the
/// target, or through the resolved upstream.
pub(crate) async fn dial_tunnel(
    shared: &Arc<Shared>,
    authority: &str,
) -> Result<TcpStream, ProxyError> {
    let target = with_default_port(authority, 443);
    let host = super::flow::host_of(&target).to_string();
    match shared.resolve_upstream(&host)? {
        None => TcpStream::connect(&target)
            .await
            .map_err(|e| connect_err(&target, e)),
        Some(UpstreamAddr::Http(proxy_addr)) => {
            let mut stream = TcpStream::connect(&proxy_addr)
                .await
                .map_err(|e| connect_err(&proxy_addr, e))?;
            http_connect_handshake(&mut stream, &target).await?;
            Ok(stream)
        }
        Some(UpstreamAddr::Socks(proxy_addr)) => {
            let stream = Socks5Stream::connect(proxy_addr.as_str(), target.as_str())
                .await
                .map_err(|e| ProxyError::Connect {
                    addr: proxy_addr.clone(),
                    message: format!("SOCKS5 upstream: {e}"),
                })?;
            Ok(stream.into_inner())
        }
    }
}

/// Issues a CONNECT for `target` on an already-open proxy stream and waits
/// for the `200` that opens the tunnel.
pub(crate) async fn http_connect_handshake<S>(
    stream: &mut S,
    target: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let refused = |message: String| ProxyError::TunnelRefused {
        target: target.to_string(),
        message,
    };

    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;

    // Read the response head only; the tunnel bytes that follow belong to
    // the caller.
    let mut head: Vec<u8> = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8 * 1024 {
            return Err(refused("oversized CONNECT response".to_string()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(refused("connection closed during CONNECT".to_string()));
        }
        head.push(byte[0]);
    }

    let status_line = std::str::from_utf8(&head)
        .ok()
        .and_then(|s| s.lines().next())
        .unwrap_or("")
        .to_string();
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status == "200" {
        Ok(())
    } else {
        warn!(%status_line, "upstream refused CONNECT for {target}");
        Err(refused(status_line))
    }
}

/// Builds the outbound TLS client config.
///
/// Verification uses the system trust store unless `insecure` is set, in
/// which case every origin certificate is accepted. ALPN is pinned to
/// HTTP/1.1 and session secrets go to `SSLKEYLOGFILE` when configured.
pub(crate) fn build_client_tls(insecure: bool) -> rustls::ClientConfig {
    let mut config = if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in native.errors {
            debug!("skipping unreadable system certificate: {err}");
        }
        for cert in native.certs {
            if let Err(err) = roots.add(cert) {
                debug!("skipping system certificate: {err}");
            }
        }
        if roots.is_empty() {
            warn!("no usable system root certificates; origin TLS will fail");
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.key_log = Arc::new(rustls::KeyLogFile::new());
    config
}

/// Accepts any origin certificate. Installed only when `ssl_insecure` is
/// set.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(crate) fn server_name_of(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("invalid server name '{host}'")))
}

fn connect_err(addr: &str, err: std::io::Error) -> ProxyError {
    ProxyError::Connect {
        addr: addr.to_string(),
        message: err.to_string(),
    }
}
