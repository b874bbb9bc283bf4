//! SOCKS5 front-end.
//!
//! A minimal SOCKS5 server (RFC 1928: no-auth method, CONNECT command,
//! IPv4/IPv6/domain targets). It never opens connections itself: the dial
//! step connects to the proxy's own HTTP listener and issues an HTTP CONNECT
//! for the SOCKS target, so SOCKS5 clients flow through exactly the same
//! interception pipeline as HTTP proxy clients.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::outbound::http_connect_handshake;
use crate::error::ProxyError;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Accept loop for the SOCKS5 listener. `http_addr` is the proxy's own HTTP
/// listener, which every tunnel is dialled through.
pub(crate) async fn run(
    listener: TcpListener,
    http_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let dial_addr = self_dial_addr(http_addr);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "SOCKS5 connection accepted");
                        tokio::spawn(async move {
                            if let Err(err) = serve_client(stream, dial_addr).await {
                                debug!(%peer, "SOCKS5 connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("SOCKS5 accept error: {err}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("SOCKS5 front-end stopped");
}

/// The HTTP listener address as seen from this process. An unspecified bind
/// host (0.0.0.0 / ::) is dialled via loopback.
fn self_dial_addr(http_addr: SocketAddr) -> SocketAddr {
    if http_addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), http_addr.port())
    } else {
        http_addr
    }
}

async fn serve_client(mut stream: TcpStream, http_addr: SocketAddr) -> Result<(), ProxyError> {
    negotiate_method(&mut stream).await?;
    let target = match read_connect_target(&mut stream).await {
        Ok(target) => target,
        Err(err) => {
            let code = match &err {
                ProxyError::Socks(msg) if msg.contains("command") => REP_COMMAND_NOT_SUPPORTED,
                ProxyError::Socks(msg) if msg.contains("address type") => REP_ATYP_NOT_SUPPORTED,
                _ => REP_GENERAL_FAILURE,
            };
            let _ = write_reply(&mut stream, code).await;
            return Err(err);
        }
    };

    debug!(target = %target, "SOCKS5 tunnel via HTTP CONNECT");

    // Tunnel through our own HTTP proxy so interception applies.
    let mut tunnel = match TcpStream::connect(http_addr).await {
        Ok(t) => t,
        Err(err) => {
            let _ = write_reply(&mut stream, REP_GENERAL_FAILURE).await;
            return Err(ProxyError::Connect {
                addr: http_addr.to_string(),
                message: err.to_string(),
            });
        }
    };
    if let Err(err) = http_connect_handshake(&mut tunnel, &target).await {
        let _ = write_reply(&mut stream, REP_GENERAL_FAILURE).await;
        return Err(err);
    }

    write_reply(&mut stream, REP_SUCCESS).await?;
    let _ = copy_bidirectional(&mut stream, &mut tunnel).await;
    Ok(())
}

/// Method negotiation: only no-auth is offered.
async fn negotiate_method<S>(stream: &mut S) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::Socks(format!(
            "unsupported version {}",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(ProxyError::Socks(
            "client offered no acceptable auth method".to_string(),
        ));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Reads the request and returns the target as `host:port`.
async fn read_connect_target<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::Socks(format!(
            "unsupported version {}",
            head[0]
        )));
    }
    if head[1] != CMD_CONNECT {
        return Err(ProxyError::Socks(format!(
            "unsupported command {}",
            head[1]
        )));
    }

    let target = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = read_port(stream).await?;
            format!("{}:{}", Ipv4Addr::from(octets), port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let port = read_port(stream).await?;
            let domain = String::from_utf8(name)
                .map_err(|_| ProxyError::Socks("domain is not valid UTF-8".to_string()))?;
            format!("{domain}:{port}")
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = read_port(stream).await?;
            format!("[{}]:{}", std::net::Ipv6Addr::from(octets), port)
        }
        other => {
            return Err(ProxyError::Socks(format!(
                "unsupported address type {other}"
            )))
        }
    };
    Ok(target)
}

async fn read_port<S>(stream: &mut S) -> Result<u16, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Reply with the given code and a zeroed IPv4 bind address.
async fn write_reply<S>(stream: &mut S, code: u8) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn negotiates_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let task = tokio::spawn(async move { negotiate_method(&mut server).await });

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_missing_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let task = tokio::spawn(async move { negotiate_method(&mut server).await });

        // Only username/password offered.
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn parses_domain_target() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let task = tokio::spawn(async move { read_connect_target(&mut server).await });

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        request.extend_from_slice(b"origin.test");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), "origin.test:443");
    }

    #[tokio::test]
    async fn parses_ipv4_target() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let task = tokio::spawn(async move { read_connect_target(&mut server).await });

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn rejects_bind_command() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let task = tokio::spawn(async move { read_connect_target(&mut server).await });

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 80])
            .await
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn unspecified_bind_dials_loopback() {
        let addr: SocketAddr = "0.0.0.0:9080".parse().unwrap();
        assert_eq!(self_dial_addr(addr).to_string(), "127.0.0.1:9080");
        let addr: SocketAddr = "192.168.1.5:9080".parse().unwrap();
        assert_eq!(self_dial_addr(addr), addr);
    }
}
