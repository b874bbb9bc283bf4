//! Command-line interface for the demo binary.
//!
//! Uses clap's derive API. The flags map one-to-one onto
//! [`Options`](crate::Options); the library itself never parses arguments.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// An intercepting HTTP/HTTPS forward proxy.
///
/// Run it, point a client at the HTTP listener, and install the root CA
/// printed at startup to intercept HTTPS.
#[derive(Parser, Debug)]
#[command(name = "spyglass")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address for the HTTP proxy listener.
    #[arg(long = "addr", default_value = "127.0.0.1:9080")]
    pub http_addr: SocketAddr,

    /// Address for the optional SOCKS5 front-end.
    #[arg(long = "socks-addr")]
    pub socks_addr: Option<SocketAddr>,

    /// Threshold in bytes above which bodies stream instead of buffering.
    #[arg(long = "stream-large-bodies", default_value_t = crate::options::DEFAULT_STREAM_LARGE_BODIES)]
    pub stream_large_bodies: usize,

    /// Skip verification of origin server certificates.
    #[arg(long = "ssl-insecure")]
    pub ssl_insecure: bool,

    /// Directory for the root CA certificate and key.
    #[arg(long = "ca-root", default_value = ".spyglass")]
    pub ca_root_path: PathBuf,

    /// Static upstream proxy URL (http://host:port or socks://host:port).
    #[arg(long = "upstream")]
    pub upstream: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Maps the parsed flags onto library options.
    pub fn to_options(&self) -> crate::Options {
        let mut options = crate::Options::new(self.http_addr)
            .with_stream_large_bodies(self.stream_large_bodies)
            .with_ssl_insecure(self.ssl_insecure)
            .with_ca_root_path(self.ca_root_path.clone());
        options.debug = self.verbose;
        if let Some(addr) = self.socks_addr {
            options = options.with_socks_addr(addr);
        }
        if let Some(upstream) = &self.upstream {
            options = options.with_upstream(upstream.clone());
        }
        options
    }
}
