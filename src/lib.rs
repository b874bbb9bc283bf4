//! spyglass: an intercepting HTTP/HTTPS forward proxy.
//!
//! A man-in-the-middle proxy library: it terminates client connections,
//! optionally decrypts TLS by forging leaf certificates under a locally
//! trusted root CA, exposes each request/response exchange to a chain of
//! [`Addon`]s that may observe, modify, or short-circuit it, and forwards
//! traffic to the true origin — directly or through an upstream proxy. An
//! optional SOCKS5 front-end funnels SOCKS clients through the same
//! pipeline.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use spyglass::{Addon, Flow, Options, Proxy};
//!
//! struct Tagger;
//! impl Addon for Tagger {
//!     fn request_headers(&self, flow: &mut Flow) {
//!         flow.request.headers.insert("x-tag", "1".parse().unwrap());
//!     }
//! }
//!
//! # async fn run() -> Result<(), spyglass::ProxyError> {
//! let mut proxy = Proxy::new(Options::default())?;
//! proxy.add_addon(Arc::new(Tagger));
//! proxy.run().await
//! # }
//! ```
//!
//! Clients must be configured to use the proxy explicitly and, for HTTPS
//! interception, must trust the root certificate exposed by
//! [`Proxy::root_cert_pem`]. HTTP/2 and HTTP/3 to origins are deliberately
//! out of scope; redirects are surfaced to the client verbatim.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod error;
pub mod options;
pub mod proxy;

pub use ca::{CertAuthority, CertStore};
pub use error::{CaError, ProxyError};
pub use options::{Options, DEFAULT_STREAM_LARGE_BODIES};
pub use proxy::{
    Addon, BodyReader, ClientConn, ConnContext, Flow, FlowRequest, FlowResponse, Proxy,
    ProxyBody, ProxyHandle, RequestUrl, UpstreamAddr,
};
