//! Flow and connection data model.
//!
//! A [`ConnContext`] lives for one client TCP connection; a [`Flow`] lives
//! for one request/response exchange on it. Flows hold a non-owning
//! back-reference to their connection, and the connection outlives every
//! flow it originates. Addons receive `&mut Flow` at each hook and may edit
//! headers, the URL, bodies, or install a response to short-circuit the
//! exchange.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::body::BodyReader;
use super::outbound::OriginConn;

/// Client half of a connection: identity and TLS state.
#[derive(Debug)]
pub struct ClientConn {
    /// Unique id for this client connection.
    pub id: Uuid,
    /// Remote address of the client.
    pub peer_addr: SocketAddr,
    tls: AtomicBool,
}

impl ClientConn {
    pub(crate) fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            tls: AtomicBool::new(false),
        }
    }

    /// Whether the interceptor has completed a TLS handshake with this
    /// client inside a CONNECT tunnel.
    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_tls(&self) {
        self.tls.store(true, Ordering::Relaxed);
    }
}

/// Per-connection state shared between the dispatcher and the interceptor.
///
/// Never shared across client connections. The origin keep-alive connection
/// hangs off this context so consecutive flows on one client connection
/// reuse it.
#[derive(Debug)]
pub struct ConnContext {
    /// The client side of this connection.
    pub client: ClientConn,
    intercept: AtomicBool,
    flow_count: AtomicU64,
    close_after_response: AtomicBool,
    pub(crate) server_conn: Mutex<Option<OriginConn>>,
    pub(crate) tunnel_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnContext {
    pub(crate) fn new(peer_addr: SocketAddr) -> Self {
        Self {
            client: ClientConn::new(peer_addr),
            intercept: AtomicBool::new(false),
            flow_count: AtomicU64::new(0),
            close_after_response: AtomicBool::new(false),
            server_conn: Mutex::new(None),
            tunnel_task: std::sync::Mutex::new(None),
        }
    }

    /// Whether this connection's CONNECT tunnel is being intercepted.
    pub fn intercept(&self) -> bool {
        self.intercept.load(Ordering::Relaxed)
    }

    pub(crate) fn set_intercept(&self, intercept: bool) {
        self.intercept.store(intercept, Ordering::Relaxed);
    }

    /// Number of flows this connection has carried so far.
    pub fn flow_count(&self) -> u64 {
        self.flow_count.load(Ordering::Relaxed)
    }

    pub(crate) fn next_flow(&self) {
        self.flow_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the connection will be closed once the current response has
    /// been written. Sticky for the rest of the connection.
    pub fn close_after_response(&self) -> bool {
        self.close_after_response.load(Ordering::Relaxed)
    }

    pub(crate) fn set_close_after_response(&self) {
        self.close_after_response.store(true, Ordering::Relaxed);
    }
}

/// The target URL of a request, kept as mutable parts so addons can redirect
/// a flow by editing scheme, authority, or path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrl {
    /// `http` or `https`.
    pub scheme: String,
    /// `host` or `host:port` as the client sent it.
    pub authority: String,
    /// Path plus optional query, always starting with `/` (empty means `/`).
    pub path_and_query: String,
}

impl RequestUrl {
    /// The host without any port.
    pub fn host(&self) -> &str {
        host_of(&self.authority)
    }
}

impl std::fmt::Display for RequestUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pq = if self.path_and_query.is_empty() {
            "/"
        } else {
            &self.path_and_query
        };
        write!(f, "{}://{}{}", self.scheme, self.authority, pq)
    }
}

/// Strips the port from an authority, handling bracketed IPv6 literals.
pub(crate) fn host_of(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        // [::1]:443 or [::1]
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            host
        }
        _ => authority,
    }
}

/// The request half of a flow.
#[derive(Debug)]
pub struct FlowRequest {
    /// HTTP method.
    pub method: Method,
    /// Target URL parts.
    pub url: RequestUrl,
    /// Request headers as received (hop-by-hop headers are stripped on the
    /// outbound copy, not here).
    pub headers: HeaderMap,
    /// Buffered request body. `None` while unread or when the body streams.
    pub body: Option<Bytes>,
}

/// The response half of a flow, or a short-circuit response installed by an
/// addon.
///
/// At most one of `body` and `body_reader` may be set; the emission path
/// treats them as mutually exclusive and prefers the reader.
pub struct FlowResponse {
    /// Status code sent to the client.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Buffered response body.
    pub body: Option<Bytes>,
    /// Streaming response body.
    pub body_reader: Option<BodyReader>,
    /// Signal `Connection: close` to the client after this response.
    pub close: bool,
}

impl FlowResponse {
    /// An empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
            body_reader: None,
            close: false,
        }
    }

    /// A response with a buffered body.
    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut resp = Self::new(status);
        resp.body = Some(body.into());
        resp
    }
}

impl std::fmt::Debug for FlowResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowResponse")
            .field("status", &self.status)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("streaming", &self.body_reader.is_some())
            .field("close", &self.close)
            .finish()
    }
}

/// One request/response exchange through the proxy.
pub struct Flow {
    /// Unique flow id.
    pub id: Uuid,
    /// The request as the addons may see and edit it.
    pub request: FlowRequest,
    /// The response; `Some` after the origin replied, or earlier when an
    /// addon short-circuits.
    pub response: Option<FlowResponse>,
    /// Route this flow through the shared pooled client instead of the
    /// connection's keep-alive client.
    pub use_separate_client: bool,
    stream: bool,
    conn: Arc<ConnContext>,
    finished: bool,
}

impl Flow {
    pub(crate) fn new(request: FlowRequest, conn: Arc<ConnContext>) -> Self {
        conn.next_flow();
        Self {
            id: Uuid::new_v4(),
            request,
            response: None,
            use_separate_client: false,
            stream: false,
            conn,
            finished: false,
        }
    }

    /// The connection this flow arrived on.
    pub fn conn(&self) -> &ConnContext {
        &self.conn
    }

    /// Whether body buffering is bypassed for this flow. Sticky: set by a
    /// threshold overflow or by an addon, never cleared.
    pub fn stream(&self) -> bool {
        self.stream
    }

    /// Puts the flow into streaming mode. Bodies will no longer be buffered
    /// and the `request`/`response` hooks are skipped for the remaining
    /// directions.
    pub fn set_stream(&mut self) {
        self.stream = true;
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }

    /// Whether this flow has been finalized.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("url", &self.request.url.to_string())
            .field("stream", &self.stream)
            .field("finished", &self.finished)
            .finish()
    }
}
