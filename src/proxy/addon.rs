//! The addon protocol.
//!
//! An addon observes and mutates flows at fixed points of their lifecycle.
//! Every operation has a default no-op body, so implementors override only
//! what they need. Addons are invoked in registration order at every hook;
//! hooks run synchronously on the task handling the request, so an addon
//! that blocks stalls exactly that flow.
//!
//! Short-circuiting: installing `flow.response` during `request_headers` or
//! `request` makes the proxy reply immediately without contacting the
//! origin; setting `flow.response.body` during `response_headers` replaces
//! the origin body. Later addons at the same hook and all later hooks are
//! skipped for that flow.
//!
//! A panicking hook is contained: the proxy logs a warning, abandons the
//! in-flight flow with a `502`, and keeps serving the connection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response};
use tracing::warn;

use super::body::{BodyReader, ProxyBody};
use super::flow::{ClientConn, ConnContext, Flow};

/// Observer/mutator registered with the proxy. All operations default to
/// no-ops.
#[allow(unused_variables)]
pub trait Addon: Send + Sync {
    /// A client TCP connection was accepted.
    fn client_connected(&self, conn: &ClientConn) {}

    /// A client TCP connection closed.
    fn client_disconnected(&self, conn: &ClientConn) {}

    /// The connection dialed its origin keep-alive connection.
    fn server_connected(&self, ctx: &ConnContext) {}

    /// The origin keep-alive connection closed.
    fn server_disconnected(&self, ctx: &ConnContext) {}

    /// TLS to the origin completed on the keep-alive connection.
    fn tls_established_server(&self, ctx: &ConnContext) {}

    /// Request line and headers are available. May edit headers or the URL,
    /// or install `flow.response` to short-circuit.
    fn request_headers(&self, flow: &mut Flow) {}

    /// The full request body is buffered in `flow.request.body`. Not called
    /// when the request body streams. May edit the body or short-circuit.
    fn request(&self, flow: &mut Flow) {}

    /// Origin status and headers are available. May edit them, or set
    /// `flow.response.body` to replace the origin body.
    fn response_headers(&self, flow: &mut Flow) {}

    /// The full response body is buffered in `flow.response.body`. Not
    /// called when the response body streams.
    fn response(&self, flow: &mut Flow) {}

    /// Wraps the request body reader before it is sent upstream. Applied in
    /// registration order; return the reader unchanged to pass through.
    fn stream_request_modifier(&self, flow: &mut Flow, reader: BodyReader) -> BodyReader {
        reader
    }

    /// Wraps the response body reader before it is written to the client.
    fn stream_response_modifier(&self, flow: &mut Flow, reader: BodyReader) -> BodyReader {
        reader
    }

    /// Called for requests addressed to the proxy itself (no absolute URI).
    /// The first addon returning `Some` owns the response.
    fn access_proxy_server(&self, req: &Request<Incoming>) -> Option<Response<ProxyBody>> {
        None
    }
}

/// Marker error: an addon hook panicked and the flow must be abandoned.
#[derive(Debug)]
pub(crate) struct AddonPanic;

/// Runs one hook invocation, converting a panic into [`AddonPanic`].
pub(crate) fn contained<R>(hook: &'static str, f: impl FnOnce() -> R) -> Result<R, AddonPanic> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|_| {
        warn!(hook, "addon panicked; abandoning flow");
        AddonPanic
    })
}

/// Fires a connection-level hook on every addon, containing panics per
/// addon. Connection hooks carry no flow to abandon, so a panic only logs.
pub(crate) fn fire_conn_hook(
    addons: &[Arc<dyn Addon>],
    hook: &'static str,
    f: impl Fn(&dyn Addon),
) {
    for addon in addons {
        if catch_unwind(AssertUnwindSafe(|| f(addon.as_ref()))).is_err() {
            warn!(hook, "addon panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::flow::{FlowRequest, RequestUrl};
    use hyper::{HeaderMap, Method};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;
    impl Addon for Noop {}

    struct Panicker;
    impl Addon for Panicker {
        fn request_headers(&self, _flow: &mut Flow) {
            panic!("boom");
        }
    }

    fn test_flow() -> Flow {
        let conn = Arc::new(ConnContext::new("127.0.0.1:50000".parse().unwrap()));
        Flow::new(
            FlowRequest {
                method: Method::GET,
                url: RequestUrl {
                    scheme: "http".to_string(),
                    authority: "example.com".to_string(),
                    path_and_query: "/".to_string(),
                },
                headers: HeaderMap::new(),
                body: None,
            },
            conn,
        )
    }

    #[test]
    fn default_hooks_are_noops() {
        let addon = Noop;
        let mut flow = test_flow();
        addon.request_headers(&mut flow);
        addon.response_headers(&mut flow);
        assert!(flow.response.is_none());
    }

    #[test]
    fn default_modifier_is_identity() {
        let addon = Noop;
        let mut flow = test_flow();
        let reader: BodyReader = Box::new(std::io::Cursor::new(b"abc".to_vec()));
        let out = addon.stream_request_modifier(&mut flow, reader);
        let drained = futures_drain(out);
        assert_eq!(drained, b"abc");
    }

    #[test]
    fn contained_catches_panic() {
        let addon = Panicker;
        let mut flow = test_flow();
        let result = contained("request_headers", || addon.request_headers(&mut flow));
        assert!(result.is_err());
    }

    #[test]
    fn conn_hook_survives_panicking_addon() {
        struct CountingPanicker(AtomicUsize);
        impl Addon for CountingPanicker {
            fn client_connected(&self, _conn: &ClientConn) {
                self.0.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            }
        }

        let counter = Arc::new(CountingPanicker(AtomicUsize::new(0)));
        let addons: Vec<Arc<dyn Addon>> = vec![counter.clone(), counter.clone()];
        let conn = ClientConn::new("127.0.0.1:50000".parse().unwrap());
        fire_conn_hook(&addons, "client_connected", |a| a.client_connected(&conn));
        // Both invocations ran despite the first panic.
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    fn futures_drain(mut reader: BodyReader) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            out
        })
    }
}
