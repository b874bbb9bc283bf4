//! Error types for the proxy core.
//!
//! Two error families cover the crate:
//! - [`CaError`] for root CA loading/generation and leaf issuance
//! - [`ProxyError`] for everything on the wire (dials, TLS, HTTP, tunnels)
//!
//! Addons never observe framing errors; malformed inbound traffic tears the
//! connection down before a flow is created.

use thiserror::Error;

/// Errors from the certificate authority and leaf store.
#[derive(Debug, Error)]
pub enum CaError {
    /// I/O on the CA directory (read/write of PEM material).
    #[error("CA I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key pair generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate construction or self-signing failed.
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),

    /// PEM material could not be parsed.
    #[error("failed to parse CA material: {0}")]
    Parse(String),

    /// Leaf signing against the root issuer failed.
    #[error("leaf signing failed: {0}")]
    Signing(String),

    /// The CA directory is in an inconsistent state (e.g. cert without key).
    #[error("invalid CA layout: {0}")]
    InvalidLayout(String),
}

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, body copies).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The inbound request is not something the proxy can route.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or config construction.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate authority failure surfaced on the wire path.
    #[error("certificate error: {0}")]
    Ca(#[from] CaError),

    /// An upstream proxy URL could not be parsed or uses an unknown scheme.
    #[error("invalid upstream proxy '{url}': {message}")]
    InvalidUpstream {
        /// The URL as configured.
        url: String,
        /// Why it was rejected.
        message: String,
    },

    /// Failed to reach the origin or an upstream proxy.
    #[error("failed to connect to '{addr}': {message}")]
    Connect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The upstream proxy refused our CONNECT.
    #[error("upstream proxy refused tunnel to '{target}': {message}")]
    TunnelRefused {
        /// The tunnel target.
        target: String,
        /// Refusal detail (status line or handshake error).
        message: String,
    },

    /// The in-process interceptor is not running or rejected the tunnel.
    #[error("interceptor unavailable: {0}")]
    Interceptor(String),

    /// SOCKS5 protocol violation or unsupported feature from a client.
    #[error("SOCKS5 error: {0}")]
    Socks(String),
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
