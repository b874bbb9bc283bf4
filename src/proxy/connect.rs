//! CONNECT tunnel handling.
//!
//! Each CONNECT is either **intercepted** — spliced into the in-process TLS
//! terminator through an in-memory pipe, so the proxy reads the plaintext
//! HTTP inside the tunnel — or **transponded** — blindly relayed to the
//! target (directly or through the resolved upstream proxy). The decision
//! defaults to intercept and can be overridden per request via
//! `set_should_intercept`.
//!
//! Addon hooks fire around the tunnel: `request_headers` before the dial, a
//! synthetic `200` response through `response_headers` once the tunnel is
//! established, and `response` when it closes. There is no `request` hook;
//! a tunnel has no decoded body.

use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::addon::contained;
use super::body::{empty_body, full_body, ProxyBody};
use super::flow::{host_of, ConnContext, Flow, FlowRequest, FlowResponse, RequestUrl};
use super::interceptor::InterceptRequest;
use super::outbound;
use super::pipeline::bad_gateway;
use super::server::Shared;
use crate::error::ProxyError;

enum Tunnel {
    /// In-memory pipe into the interceptor.
    Pipe(tokio::io::DuplexStream),
    /// Raw stream to the target or an upstream proxy.
    Transpond(TcpStream),
}

pub(crate) async fn handle_connect(
    shared: Arc<Shared>,
    conn: Arc<ConnContext>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body("CONNECT requires a host:port target"))
            .unwrap());
    };

    let intercept = shared.should_intercept(&authority);
    conn.set_intercept(intercept);

    let mut flow = Flow::new(
        FlowRequest {
            method: req.method().clone(),
            url: RequestUrl {
                scheme: "https".to_string(),
                authority: authority.clone(),
                path_and_query: String::new(),
            },
            headers: req.headers().clone(),
            body: None,
        },
        Arc::clone(&conn),
    );

    for addon in &shared.addons {
        if contained("request_headers", || addon.request_headers(&mut flow)).is_err() {
            return Ok(bad_gateway());
        }
    }

    let tunnel = if intercept {
        debug!(host = %authority, "begin intercept");
        let certified = match shared.cert_store.get(host_of(&authority)) {
            Ok(key) => key,
            Err(err) => {
                warn!(host = %authority, %err, "leaf issuance failed");
                return Ok(bad_gateway());
            }
        };
        let (near, far) = tokio::io::duplex(64 * 1024);
        let request = InterceptRequest {
            host: authority.clone(),
            certified,
            io: far,
            conn: Arc::clone(&conn),
        };
        if shared.intercept_tx.send(request).await.is_err() {
            warn!(host = %authority, "interceptor is not running");
            return Ok(bad_gateway());
        }
        Tunnel::Pipe(near)
    } else {
        debug!(host = %authority, "begin transpond");
        match outbound::dial_tunnel(&shared, &authority).await {
            Ok(stream) => Tunnel::Transpond(stream),
            Err(err) => {
                warn!(host = %authority, %err, "tunnel dial failed");
                return Ok(bad_gateway());
            }
        }
    };

    // The 200 below triggers the upgrade; the spliced tunnel runs in its own
    // task for the rest of the connection's life.
    let task = tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(host = %authority, "tunnel upgrade failed: {err}");
                return;
            }
        };

        flow.response = Some(FlowResponse::new(StatusCode::OK));
        for addon in &shared.addons {
            let _ = contained("response_headers", || addon.response_headers(&mut flow));
        }

        let mut client = TokioIo::new(upgraded);
        let result = match tunnel {
            Tunnel::Pipe(mut pipe) => copy_bidirectional(&mut client, &mut pipe).await,
            Tunnel::Transpond(mut stream) => copy_bidirectional(&mut client, &mut stream).await,
        };
        match result {
            Ok((up, down)) => debug!(host = %authority, up, down, "tunnel closed"),
            Err(err) => debug!(host = %authority, "tunnel ended: {err}"),
        }

        for addon in &shared.addons {
            let _ = contained("response", || addon.response(&mut flow));
        }
        flow.finish();
    });
    *conn.tunnel_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap())
}
