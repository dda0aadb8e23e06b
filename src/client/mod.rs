//! Connection handlers: the layer that actually speaks HTTP.
//!
//! A [`Handler`] owns a pool of connections and exchanges one request for one response head,
//! leaving the body on the wire for the caller to read. The transport classifies whatever a
//! handler raises, so handlers report failures as [`ClientError`] with the original cause kept
//! in the source chain.

mod chunked;
mod connect;
mod decode;
mod encode;
mod error;
mod pool;

use futures_util::future::BoxFuture;
use futures_util::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use http::header::{self, HeaderMap};
use http::uri::Scheme;
use http::{Method, StatusCode, Uri};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::body::Body;
use crate::cancel::CancelToken;
use crate::settings::{ConnectionSettings, Proxy};
use crate::timeout::timeout;
use decode::{read_head, Framing, ResponseHead};
use encode::{encode_head, write_body};
use pool::{Connection, ConnectionPool, Lease, Permit, ResponseStream};

pub use connect::{Connector, Endpoint, Io, TcpConnector, TlsPolicy};
pub use encode::{OutgoingBody, OutgoingRequest};
pub use error::{ClientError, Kind};

/// Largest response head accepted.
pub const MAX_RESPONSE_HEAD_SIZE: usize = 64 * 1024;
/// Redirect hops followed when auto-redirect is enabled.
pub const MAX_AUTO_REDIRECTS: usize = 3;

/// A pooled-connection handler.
pub trait Handler: Send + Sync {
    /// Send `request` and wait for the response head. The body is left streaming.
    fn dispatch(
        &self,
        request: OutgoingRequest,
        token: CancelToken,
    ) -> BoxFuture<'_, Result<IncomingResponse, ClientError>>;

    /// Release pooled connections. Requests in flight are not interrupted.
    fn close(&self);
}

/// Builds handlers for the handler cache.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, options: HandlerOptions) -> Arc<dyn Handler>;
}

/// A response head, with the body still on the connection.
#[derive(Debug)]
pub struct IncomingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Declared length of the body, if framing gives one.
    pub content_length: Option<u64>,
    pub body: Body,
}

/// Everything a handler is built from.
#[derive(Clone)]
pub struct HandlerOptions {
    pub proxy: Option<Arc<Proxy>>,
    /// `None` waits for the connector however long it takes.
    pub connect_timeout: Option<Duration>,
    pub allow_auto_redirect: bool,
    pub max_auto_redirects: usize,
    pub idle_timeout: Duration,
    pub connection_lifetime: Option<Duration>,
    pub max_connections_per_endpoint: usize,
    pub max_response_head_size: usize,
    pub max_response_drain_size: u64,
    pub tls: TlsPolicy,
    pub connector: Arc<dyn Connector>,
}

impl HandlerOptions {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            proxy: settings.proxy.clone(),
            connect_timeout: settings.connection_timeout,
            allow_auto_redirect: settings.allow_auto_redirect,
            max_auto_redirects: MAX_AUTO_REDIRECTS,
            idle_timeout: settings.idle_timeout,
            connection_lifetime: settings.connection_lifetime,
            max_connections_per_endpoint: settings.max_connections_per_endpoint,
            max_response_head_size: MAX_RESPONSE_HEAD_SIZE,
            max_response_drain_size: settings.max_response_drain_size,
            tls: TlsPolicy::default(),
            connector: Arc::new(TcpConnector),
        }
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        let settings = crate::settings::TransportSettings::default();
        Self::from_settings(&settings.connection_settings(settings.connection_timeout))
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("proxy", &self.proxy)
            .field("connect_timeout", &self.connect_timeout)
            .field("allow_auto_redirect", &self.allow_auto_redirect)
            .field("max_auto_redirects", &self.max_auto_redirects)
            .field("idle_timeout", &self.idle_timeout)
            .field("connection_lifetime", &self.connection_lifetime)
            .field("max_connections_per_endpoint", &self.max_connections_per_endpoint)
            .field("max_response_head_size", &self.max_response_head_size)
            .field("max_response_drain_size", &self.max_response_drain_size)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Builds [`Http1Handler`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct Http1HandlerFactory;

impl HandlerFactory for Http1HandlerFactory {
    fn create(&self, options: HandlerOptions) -> Arc<dyn Handler> {
        Arc::new(Http1Handler::new(options))
    }
}

/// HTTP/1.1 handler with keep-alive connection pooling.
pub struct Http1Handler {
    options: HandlerOptions,
    pool: Arc<ConnectionPool>,
}

/// Why a round trip failed.
enum Attempt {
    /// A reused connection turned out to be dead before any response byte arrived.
    Stale(ClientError),
    Failed(ClientError),
}

impl Http1Handler {
    pub fn new(options: HandlerOptions) -> Self {
        let pool = ConnectionPool::new(
            options.max_connections_per_endpoint,
            options.idle_timeout,
            options.connection_lifetime,
        );
        Self {
            options,
            pool: Arc::new(pool),
        }
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    async fn execute(&self, mut request: OutgoingRequest) -> Result<IncomingResponse, ClientError> {
        let mut redirects = 0;
        loop {
            let follow = self.options.allow_auto_redirect && redirects < self.options.max_auto_redirects;
            let retained = if follow { request.try_clone() } else { None };

            let response = self.exchange(request).await?;

            let next = match retained {
                Some(previous) => redirect(previous, &response),
                None => None,
            };
            match next {
                Some(next) => {
                    debug!(status = %response.status, location = %next.uri, "Following redirect");
                    drain(response.body, self.options.max_response_drain_size).await;
                    redirects += 1;
                    request = next;
                }
                None => return Ok(response),
            }
        }
    }

    /// One request, one response head. Retries once on a fresh connection if a pooled one
    /// turns out to be dead and the body can be sent again.
    async fn exchange(&self, request: OutgoingRequest) -> Result<IncomingResponse, ClientError> {
        let endpoint = self.endpoint_for(&request.uri)?;
        let head = encode_head(&request, self.options.proxy.is_some())?;
        let method = request.method;
        let mut body = request.body;

        let permit = self.pool.acquire(&endpoint).await;

        if let Some(conn) = self.pool.checkout(&endpoint) {
            let spare = body.try_clone();
            match self.round_trip(conn, &head, body).await {
                Ok((conn, head)) => return self.respond(conn, head, &method, endpoint, permit),
                Err(Attempt::Stale(err)) => match spare {
                    Some(spare) => {
                        debug!(%endpoint, error = %err, "Pooled connection was closed, retrying on a new one");
                        body = spare;
                    }
                    None => return Err(err),
                },
                Err(Attempt::Failed(err)) => return Err(err),
            }
        }

        let conn = self.connect(&endpoint).await?;
        match self.round_trip(conn, &head, body).await {
            Ok((conn, head)) => self.respond(conn, head, &method, endpoint, permit),
            Err(Attempt::Stale(err)) | Err(Attempt::Failed(err)) => Err(err),
        }
    }

    fn endpoint_for(&self, uri: &Uri) -> Result<Endpoint, ClientError> {
        if let Some(proxy) = &self.options.proxy {
            if uri.scheme() == Some(&Scheme::HTTPS) {
                return Err(ClientError::request(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "https through a proxy is not supported",
                )));
            }
            let authority = proxy.authority();
            return Ok(Endpoint::new(authority.host(), authority.port_u16().unwrap_or(80), false));
        }

        Endpoint::from_uri(uri).ok_or_else(|| {
            ClientError::request(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot send to {}", uri),
            ))
        })
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, ClientError> {
        let connecting = self.options.connector.connect(endpoint, &self.options.tls);
        let io = match self.options.connect_timeout {
            Some(dur) => match timeout(dur, connecting).await {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", dur),
                )),
            },
            None => connecting.await,
        };

        match io {
            Ok(io) => {
                trace!(%endpoint, "Connected");
                Ok(Connection::new(io))
            }
            Err(err) => {
                debug!(%endpoint, error = %err, "Connect failed");
                Err(ClientError::request(err))
            }
        }
    }

    async fn round_trip(
        &self,
        mut conn: Connection,
        head: &[u8],
        body: OutgoingBody,
    ) -> Result<(Connection, ResponseHead), Attempt> {
        let reused = conn.reused;
        let stale = |err: ClientError| if reused { Attempt::Stale(err) } else { Attempt::Failed(err) };

        if let Err(err) = conn.io.write_all(head).await {
            return Err(stale(ClientError::request(err)));
        }
        write_body(&mut conn.io, body).await.map_err(Attempt::Failed)?;
        conn.io
            .flush()
            .await
            .map_err(|err| Attempt::Failed(ClientError::request(err)))?;

        let mut interim = false;
        loop {
            match read_head(&mut conn.io, self.options.max_response_head_size).await {
                Ok(Some(head)) if head.is_interim() => {
                    trace!(status = %head.status, "Skipping interim response");
                    interim = true;
                }
                Ok(Some(head)) => return Ok((conn, head)),
                Ok(None) => {
                    let err = ClientError::request(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before a response was received",
                    ));
                    return Err(if interim { Attempt::Failed(err) } else { stale(err) });
                }
                Err(err) if !interim && is_connection_reset(&err) => return Err(stale(err)),
                Err(err) => return Err(Attempt::Failed(err)),
            }
        }
    }

    fn respond(
        &self,
        conn: Connection,
        head: ResponseHead,
        method: &Method,
        endpoint: Endpoint,
        permit: Permit,
    ) -> Result<IncomingResponse, ClientError> {
        let framing = decode::framing(method, &head)?;
        let keep_alive = head.keep_alive() && !self.pool.is_closed();
        let content_length = match framing {
            Framing::Empty => Some(0),
            Framing::Length(len) => Some(len),
            Framing::Chunked | Framing::Close => None,
        };

        let lease = Lease {
            pool: self.pool.clone(),
            endpoint,
            permit,
        };
        let stream = ResponseStream::new(conn, framing, keep_alive, lease);

        Ok(IncomingResponse {
            status: head.status,
            headers: head.headers,
            content_length,
            body: Body::from_reader(BufReader::new(stream), content_length),
        })
    }
}

impl Handler for Http1Handler {
    fn dispatch(
        &self,
        request: OutgoingRequest,
        token: CancelToken,
    ) -> BoxFuture<'_, Result<IncomingResponse, ClientError>> {
        Box::pin(async move {
            match token.guard(self.execute(request)).await {
                Ok(res) => res,
                Err(_) => Err(ClientError::canceled()),
            }
        })
    }

    fn close(&self) {
        self.pool.close();
    }
}

impl Drop for Http1Handler {
    // response streams still reading keep the pool alive; they must not return connections to it
    fn drop(&mut self) {
        self.pool.close();
    }
}

fn is_connection_reset(err: &ClientError) -> bool {
    err.kind() == Kind::Request
        && err
            .source()
            .and_then(|source| source.downcast_ref::<io::Error>())
            .map_or(false, |err| {
                matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
                )
            })
}

/// The request to send next if `response` is a redirect that should be followed.
fn redirect(mut previous: OutgoingRequest, response: &IncomingResponse) -> Option<OutgoingRequest> {
    let status = response.status;
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return None;
    }

    let location = response.headers.get(header::LOCATION)?.to_str().ok()?;
    let uri = resolve_location(&previous.uri, location)?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return None,
    }

    let to_get = (status == StatusCode::SEE_OTHER && previous.method != Method::HEAD)
        || (matches!(status.as_u16(), 301 | 302) && previous.method == Method::POST);
    if to_get {
        previous.method = Method::GET;
        previous.body = OutgoingBody::Empty;
        previous.headers.remove(header::CONTENT_TYPE);
    }

    previous.headers.remove(header::HOST);
    if uri.authority() != previous.uri.authority() {
        previous.headers.remove(header::AUTHORIZATION);
    }
    previous.uri = uri;

    Some(previous)
}

fn resolve_location(base: &Uri, location: &str) -> Option<Uri> {
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() {
            return Some(uri);
        }
    }

    let path = if location.starts_with('/') {
        location.to_owned()
    } else {
        let dir = base.path().rsplit_once('/').map_or("", |(dir, _)| dir);
        format!("{}/{}", dir, location)
    };

    Uri::builder()
        .scheme(base.scheme()?.clone())
        .authority(base.authority()?.clone())
        .path_and_query(path.as_str())
        .build()
        .ok()
}

/// Read off an unwanted body so its connection goes back to the pool. Bodies longer than
/// `limit` are abandoned, and their connection closed.
async fn drain(body: Body, limit: u64) {
    let mut sink = futures_util::io::sink();
    if let Err(err) = futures_util::io::copy(body.take(limit.saturating_add(1)), &mut sink).await {
        trace!(error = %err, "Failed draining redirect body");
    }
}
