//! Opening connections to an endpoint.

use futures_util::future::BoxFuture;
use futures_util::io::{AsyncRead, AsyncWrite};
use http::Uri;
use smol::net::TcpStream;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{trace, warn};

use crate::classify::SocketError;

/// A bidirectional byte stream a request can be exchanged over.
pub trait Io: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// Where a connection goes. Connections are pooled per endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        let host = host.into();
        // ipv6 literals arrive bracketed from uris
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);
        Self { host, port, secure }
    }

    /// The endpoint a request for `uri` is sent to, ignoring proxies.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") | None => false,
            Some(_) => return None,
        };
        let host = uri.host()?;
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        Some(Self::new(host, port, secure))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Certificate checks applied to secure connections.
///
/// **The default accepts any server certificate and skips revocation checks.** Traffic is still
/// encrypted, but the server's identity is not verified, so anyone able to intercept the
/// connection can impersonate it. This is only appropriate where the network path is trusted.
/// Set `accept_invalid_certificates` to `false` through the handler tuning hook to verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsPolicy {
    pub accept_invalid_certificates: bool,
    pub check_certificate_revocation: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            accept_invalid_certificates: true,
            check_certificate_revocation: false,
        }
    }
}

/// Opens connections. Secure endpoints need a connector that layers TLS, honoring the
/// [`TlsPolicy`] it is given.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint, tls: &'a TlsPolicy) -> BoxFuture<'a, io::Result<Box<dyn Io>>>;
}

/// Plain TCP connector.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl TcpConnector {
    async fn resolve(endpoint: &Endpoint) -> io::Result<Vec<SocketAddr>> {
        let target = (endpoint.host.clone(), endpoint.port);
        let addrs = smol::unblock(move || target.to_socket_addrs().map(Iterator::collect::<Vec<_>>)).await;

        match addrs {
            Ok(addrs) if !addrs.is_empty() => Ok(addrs),
            Ok(_) => Err(io::Error::new(io::ErrorKind::Other, SocketError::HostNotFound)),
            Err(err) => {
                trace!(%endpoint, error = %err, "Name resolution failed");
                Err(io::Error::new(io::ErrorKind::Other, SocketError::HostNotFound))
            }
        }
    }

    async fn connect_tcp(endpoint: &Endpoint) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in Self::resolve(endpoint).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(%endpoint, error = %err, "Failed to disable Nagle's algorithm");
                    }
                    return Ok(stream);
                }
                Err(err) => {
                    trace!(%endpoint, %addr, error = %err, "Connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, SocketError::HostNotFound)))
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint, _tls: &'a TlsPolicy) -> BoxFuture<'a, io::Result<Box<dyn Io>>> {
        Box::pin(async move {
            if endpoint.secure {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "TcpConnector cannot open secure connections",
                ));
            }
            let stream = Self::connect_tcp(endpoint).await?;
            Ok(Box::new(stream) as Box<dyn Io>)
        })
    }
}
