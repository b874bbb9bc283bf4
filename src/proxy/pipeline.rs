//! The forward pipeline: one flow from inbound request to written response.
//!
//! Per flow the hooks fire in strict order: `request_headers`, `request`
//! (buffered only), `response_headers`, `response` (buffered only), with the
//! stream modifier chains applied between body resolution and transmission.
//! A short-circuit response installed at a pre-forward hook skips the origin
//! entirely; a preset body at `response_headers` skips the origin body.
//!
//! Bodies are governed by the streaming threshold: whatever fits is buffered
//! and exposed to the buffered hooks, anything larger flips the flow into
//! stream mode for good. Outbound headers are the flow's headers (addon
//! edits included) minus hop-by-hop headers; framing headers are recomputed
//! from the actual body.

use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::{HeaderMap, Request, Response, StatusCode};
use tracing::{debug, warn};

use super::addon::{contained, AddonPanic};
use super::body::{self, BodyReader, GatedBody, ProxyBody};
use super::flow::{ConnContext, Flow, FlowRequest, FlowResponse, RequestUrl};
use super::outbound::{self, OriginKey};
use super::server::Shared;
use crate::error::ProxyError;

/// Hop-by-hop headers, never forwarded in either direction. `Content-Length`
/// is also dropped: framing is recomputed from the body actually sent.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

enum FlowAbort {
    Panic,
    Error(ProxyError),
}

impl From<AddonPanic> for FlowAbort {
    fn from(_: AddonPanic) -> Self {
        FlowAbort::Panic
    }
}

impl From<ProxyError> for FlowAbort {
    fn from(err: ProxyError) -> Self {
        FlowAbort::Error(err)
    }
}

impl From<std::io::Error> for FlowAbort {
    fn from(err: std::io::Error) -> Self {
        FlowAbort::Error(ProxyError::Io(err))
    }
}

/// Drives one request through the pipeline, always yielding a response to
/// write. Failures before the origin response is constructed surface as
/// `502 Bad Gateway`.
pub(crate) async fn run_flow(
    shared: Arc<Shared>,
    conn: Arc<ConnContext>,
    req: Request<Incoming>,
    scheme: String,
    authority: String,
) -> Response<ProxyBody> {
    match drive_flow(&shared, &conn, req, scheme, authority).await {
        Ok(response) => response,
        Err(FlowAbort::Panic) => bad_gateway(),
        Err(FlowAbort::Error(err)) => {
            warn!(%err, "flow failed");
            bad_gateway()
        }
    }
}

async fn drive_flow(
    shared: &Arc<Shared>,
    conn: &Arc<ConnContext>,
    req: Request<Incoming>,
    scheme: String,
    authority: String,
) -> Result<Response<ProxyBody>, FlowAbort> {
    let threshold = shared.options.stream_threshold();
    let (parts, inbound_body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut flow = Flow::new(
        FlowRequest {
            method: parts.method,
            url: RequestUrl {
                scheme,
                authority,
                path_and_query,
            },
            headers: parts.headers,
            body: None,
        },
        Arc::clone(conn),
    );

    debug!(flow = %flow.id, method = %flow.request.method, url = %flow.request.url, "flow started");

    let raw_scheme = flow.request.url.scheme.clone();
    let raw_authority = flow.request.url.authority.clone();

    // request_headers: any addon may short-circuit; later addons and all
    // later hooks are skipped.
    for addon in &shared.addons {
        contained("request_headers", || addon.request_headers(&mut flow))?;
        if flow.response.is_some() {
            return Ok(reply(&mut flow));
        }
    }

    // Resolve the request body against the threshold.
    let mut streamed_request: Option<BodyReader> = None;
    if flow.stream() {
        streamed_request = Some(Box::new(body::BodyToReader::new(inbound_body)));
    } else {
        match body::gate_body(inbound_body, threshold).await? {
            GatedBody::Buffered(buf) => {
                flow.request.body = Some(buf);
                for addon in &shared.addons {
                    contained("request", || addon.request(&mut flow))?;
                    if flow.response.is_some() {
                        return Ok(reply(&mut flow));
                    }
                }
            }
            GatedBody::Streaming(reader) => {
                warn!(flow = %flow.id, threshold, "request body exceeds threshold, streaming");
                flow.set_stream();
                streamed_request = Some(reader);
            }
        }
    }

    // Request modifier chain, then the outbound body. Buffered bodies are
    // re-collected after the chain so the origin sees an exact length.
    let out_body: ProxyBody = match streamed_request {
        Some(reader) => {
            let reader = apply_modifiers(shared, &mut flow, reader, Direction::Request)?;
            body::reader_body(reader)
        }
        None => {
            let buffered = flow.request.body.clone().unwrap_or_default();
            let reader: BodyReader = Box::new(std::io::Cursor::new(buffered.to_vec()));
            let reader = apply_modifiers(shared, &mut flow, reader, Direction::Request)?;
            let modified = body::drain_reader(reader).await?;
            body::full_body(modified)
        }
    };

    // Forward. The separate pooled client serves flows that asked for it and
    // flows whose target was rewritten by addons.
    let key = OriginKey::from_url(&flow.request.url)?;
    let separate = flow.use_separate_client
        || flow.request.url.scheme != raw_scheme
        || flow.request.url.authority != raw_authority;
    let headers = end_to_end_headers(&flow.request.headers);

    let origin_response = if separate {
        outbound::send_separate(
            shared,
            key,
            &flow.request.method,
            &flow.request.url,
            headers,
            out_body,
        )
        .await?
    } else {
        outbound::send_keepalive(
            shared,
            conn,
            key,
            &flow.request.method,
            &flow.request.url,
            headers,
            out_body,
        )
        .await?
    };

    let close = wants_close(origin_response.headers());
    if close {
        conn.set_close_after_response();
    }
    let (rparts, origin_body) = origin_response.into_parts();
    flow.response = Some(FlowResponse {
        status: rparts.status,
        headers: rparts.headers,
        body: None,
        body_reader: None,
        close,
    });

    // response_headers: a preset body replaces the origin body outright.
    for addon in &shared.addons {
        contained("response_headers", || addon.response_headers(&mut flow))?;
        if flow.response.as_ref().is_some_and(|r| r.body.is_some()) {
            return Ok(reply(&mut flow));
        }
    }

    // Resolve the response body against the threshold.
    let mut streamed_response: Option<BodyReader> = None;
    if flow.stream() {
        streamed_response = Some(Box::new(body::BodyToReader::new(origin_body)));
    } else {
        match body::gate_body(origin_body, threshold).await? {
            GatedBody::Buffered(buf) => {
                if let Some(resp) = flow.response.as_mut() {
                    resp.body = Some(buf);
                }
                for addon in &shared.addons {
                    contained("response", || addon.response(&mut flow))?;
                }
            }
            GatedBody::Streaming(reader) => {
                warn!(flow = %flow.id, threshold, "response body exceeds threshold, streaming");
                flow.set_stream();
                streamed_response = Some(reader);
            }
        }
    }

    // Response modifier chain.
    match streamed_response {
        Some(reader) => {
            let reader = apply_modifiers(shared, &mut flow, reader, Direction::Response)?;
            if let Some(resp) = flow.response.as_mut() {
                resp.body_reader = Some(reader);
                resp.body = None;
            }
        }
        None => {
            let buffered = flow
                .response
                .as_ref()
                .and_then(|r| r.body.clone())
                .unwrap_or_default();
            let reader: BodyReader = Box::new(std::io::Cursor::new(buffered.to_vec()));
            let reader = apply_modifiers(shared, &mut flow, reader, Direction::Response)?;
            let modified = body::drain_reader(reader).await?;
            if let Some(resp) = flow.response.as_mut() {
                resp.body = Some(modified);
            }
        }
    }

    Ok(reply(&mut flow))
}

#[derive(Clone, Copy)]
enum Direction {
    Request,
    Response,
}

fn apply_modifiers(
    shared: &Arc<Shared>,
    flow: &mut Flow,
    mut reader: BodyReader,
    direction: Direction,
) -> Result<BodyReader, AddonPanic> {
    for addon in &shared.addons {
        reader = match direction {
            Direction::Request => contained("stream_request_modifier", || {
                addon.stream_request_modifier(flow, reader)
            })?,
            Direction::Response => contained("stream_response_modifier", || {
                addon.stream_response_modifier(flow, reader)
            })?,
        };
    }
    Ok(reader)
}

/// Builds the client-facing response from the flow and finalizes it.
///
/// Body source precedence when more than one is present (a defect, logged):
/// the streaming reader wins, then buffered bytes, then empty.
fn reply(flow: &mut Flow) -> Response<ProxyBody> {
    let taken = flow.response.take();
    flow.finish();

    let Some(mut fr) = taken else {
        return bad_gateway();
    };

    if fr.body_reader.is_some() && fr.body.is_some() {
        warn!(flow = %flow.id, "response has both a reader and buffered bytes; using the reader");
    }

    let payload = if let Some(reader) = fr.body_reader.take() {
        body::reader_body(reader)
    } else if let Some(bytes) = fr.body.take() {
        body::full_body(bytes)
    } else {
        body::empty_body()
    };

    let mut response = Response::builder()
        .status(fr.status)
        .body(payload)
        .unwrap();
    *response.headers_mut() = end_to_end_headers(&fr.headers);
    if fr.close || flow.conn().close_after_response() {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

pub(crate) fn bad_gateway() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(body::empty_body())
        .unwrap()
}

/// Copies end-to-end headers, dropping the fixed hop-by-hop set, anything
/// named by a `Connection` header, and the framing headers the transport
/// recomputes (`Content-Length`, `Host`).
pub(crate) fn end_to_end_headers(src: &HeaderMap) -> HeaderMap {
    let mut connection_named: Vec<String> = Vec::new();
    for value in src.get_all(CONNECTION) {
        if let Ok(s) = value.to_str() {
            connection_named.extend(s.split(',').map(|t| t.trim().to_ascii_lowercase()));
        }
    }

    let mut out = HeaderMap::new();
    for (name, value) in src {
        let lname = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lname.as_str())
            || connection_named.iter().any(|n| *n == lname)
            || lname == "content-length"
            || lname == "host"
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    })
}
