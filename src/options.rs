//! Proxy configuration.
//!
//! [`Options`] is the immutable configuration record handed to
//! [`Proxy::new`](crate::Proxy::new). The embedder constructs it directly or
//! through the builder-style setters; once the proxy is running it is never
//! mutated.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Default threshold at which request/response bodies switch from buffered
/// to streaming mode (5 MiB).
pub const DEFAULT_STREAM_LARGE_BODIES: usize = 5 * 1024 * 1024;

/// Configuration for a [`Proxy`](crate::Proxy).
#[derive(Debug, Clone)]
pub struct Options {
    /// Address the HTTP proxy listener binds to.
    pub http_addr: SocketAddr,
    /// Optional address for the SOCKS5 front-end. When set, SOCKS5 clients
    /// are tunnelled into the HTTP listener and share the same interception
    /// pipeline.
    pub socks_addr: Option<SocketAddr>,
    /// Bodies larger than this many bytes bypass buffering and the
    /// `request`/`response` hooks for their direction. Zero selects
    /// [`DEFAULT_STREAM_LARGE_BODIES`].
    pub stream_large_bodies: usize,
    /// Skip verification of origin server certificates.
    pub ssl_insecure: bool,
    /// Directory holding the root CA certificate and key (PEM). Generated on
    /// first run if absent.
    pub ca_root_path: PathBuf,
    /// Static upstream proxy URL (`http://host:port` or `socks://host:port`).
    /// Overridden by a per-request callback, overrides the environment.
    pub upstream: Option<String>,
    /// Verbosity knob for embedders that map it onto their log filter.
    pub debug: u8,
}

impl Options {
    /// Creates options with the given HTTP listen address and defaults for
    /// everything else.
    pub fn new(http_addr: SocketAddr) -> Self {
        Self {
            http_addr,
            socks_addr: None,
            stream_large_bodies: DEFAULT_STREAM_LARGE_BODIES,
            ssl_insecure: false,
            ca_root_path: PathBuf::from(".spyglass"),
            upstream: None,
            debug: 0,
        }
    }

    /// Sets the SOCKS5 front-end address.
    pub fn with_socks_addr(mut self, addr: SocketAddr) -> Self {
        self.socks_addr = Some(addr);
        self
    }

    /// Sets the buffered-body threshold in bytes.
    pub fn with_stream_large_bodies(mut self, bytes: usize) -> Self {
        self.stream_large_bodies = bytes;
        self
    }

    /// Disables origin certificate verification.
    pub fn with_ssl_insecure(mut self, insecure: bool) -> Self {
        self.ssl_insecure = insecure;
        self
    }

    /// Sets the CA material directory.
    pub fn with_ca_root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_root_path = path.into();
        self
    }

    /// Sets the static upstream proxy URL.
    pub fn with_upstream(mut self, url: impl Into<String>) -> Self {
        self.upstream = Some(url.into());
        self
    }

    /// The effective streaming threshold, substituting the default for zero.
    pub(crate) fn stream_threshold(&self) -> usize {
        if self.stream_large_bodies == 0 {
            DEFAULT_STREAM_LARGE_BODIES
        } else {
            self.stream_large_bodies
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 9080)))
    }
}
