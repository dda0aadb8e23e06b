//! Idle connections and per-endpoint limits.
//!
//! A connection is either checked out (owned by one request, and later by the response body
//! stream) or idle in the pool. Nothing else holds it. Every checked-out connection also holds a
//! permit for its endpoint, which bounds how many requests are in flight per endpoint.

use async_channel::{Receiver, Sender};
use futures_util::io::{AsyncRead, BufReader};
use futures_util::ready;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::trace;

use super::chunked::ChunkedDecoder;
use super::connect::{Endpoint, Io};
use super::decode::Framing;

pub(crate) struct Connection {
    pub(crate) io: BufReader<Box<dyn Io>>,
    created: Instant,
    /// Whether this connection carried an earlier request.
    pub(crate) reused: bool,
}

impl Connection {
    pub(crate) fn new(io: Box<dyn Io>) -> Self {
        Self {
            io: BufReader::new(io),
            created: Instant::now(),
            reused: false,
        }
    }
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

pub(crate) struct ConnectionPool {
    idle: Mutex<HashMap<Endpoint, Vec<IdleConnection>>>,
    limits: Mutex<HashMap<Endpoint, (Sender<()>, Receiver<()>)>>,
    max_per_endpoint: usize,
    idle_timeout: Duration,
    lifetime: Option<Duration>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(max_per_endpoint: usize, idle_timeout: Duration, lifetime: Option<Duration>) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
            max_per_endpoint: max_per_endpoint.max(1),
            idle_timeout,
            lifetime,
            closed: AtomicBool::new(false),
        }
    }

    /// Wait until fewer than the maximum number of requests are in flight to `endpoint`.
    pub(crate) async fn acquire(&self, endpoint: &Endpoint) -> Permit {
        let (sender, receiver) = {
            let mut limits = self.limits.lock().expect("connection pool poisoned");
            // a channel only the map holds has no permits out and nobody waiting on it
            limits.retain(|ep, (sender, receiver)| {
                ep == endpoint || sender.sender_count() > 1 || receiver.receiver_count() > 1
            });
            limits
                .entry(endpoint.clone())
                .or_insert_with(|| async_channel::bounded(self.max_per_endpoint))
                .clone()
        };

        if sender.is_full() {
            trace!(%endpoint, "Waiting for a connection slot");
        }
        // both halves are held here, so the channel never closes
        let _ = sender.send(()).await;
        Permit { slot: receiver }
    }

    /// Most recently used idle connection to `endpoint` that is still fresh.
    pub(crate) fn checkout(&self, endpoint: &Endpoint) -> Option<Connection> {
        let now = Instant::now();
        let mut idle = self.idle.lock().expect("connection pool poisoned");
        let conns = idle.get_mut(endpoint)?;

        let mut found = None;
        while let Some(entry) = conns.pop() {
            if self.is_expired(&entry, now) {
                trace!(%endpoint, "Discarding expired idle connection");
                continue;
            }
            let mut conn = entry.conn;
            conn.reused = true;
            found = Some(conn);
            break;
        }
        if conns.is_empty() {
            idle.remove(endpoint);
        }
        found
    }

    /// Return a connection that finished a response cleanly.
    pub(crate) fn release(&self, endpoint: &Endpoint, conn: Connection) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        let entry = IdleConnection { conn, since: now };
        if self.outlived(&entry.conn, now) {
            trace!(%endpoint, "Not pooling connection past its lifetime");
            return;
        }

        let mut idle = self.idle.lock().expect("connection pool poisoned");
        idle.retain(|_, conns| {
            conns.retain(|entry| !self.is_expired(entry, now));
            !conns.is_empty()
        });
        idle.entry(endpoint.clone()).or_default().push(entry);
    }

    /// Drop every idle connection, and stop pooling.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.idle.lock().expect("connection pool poisoned").clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.idle
            .lock()
            .unwrap()
            .get(endpoint)
            .map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn tracked_endpoints(&self) -> (usize, usize) {
        let idle = self.idle.lock().unwrap().len();
        let limits = self.limits.lock().unwrap().len();
        (idle, limits)
    }

    fn is_expired(&self, entry: &IdleConnection, now: Instant) -> bool {
        now.saturating_duration_since(entry.since) >= self.idle_timeout || self.outlived(&entry.conn, now)
    }

    fn outlived(&self, conn: &Connection, now: Instant) -> bool {
        self.lifetime
            .map_or(false, |lifetime| now.saturating_duration_since(conn.created) >= lifetime)
    }
}

/// A slot in an endpoint's in-flight limit. Freed on drop.
pub(crate) struct Permit {
    slot: Receiver<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.slot.try_recv();
    }
}

/// What a response body stream needs to hand its connection back.
pub(crate) struct Lease {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) endpoint: Endpoint,
    pub(crate) permit: Permit,
}

enum BodyState {
    Length(u64),
    Chunked(ChunkedDecoder),
    Close,
    Done,
}

/// The body of a response, read straight off its connection.
///
/// Reaching the end of the body returns the connection to the pool if it can be reused. Dropping
/// the stream before that closes the connection.
pub(crate) struct ResponseStream {
    conn: Option<Connection>,
    state: BodyState,
    keep_alive: bool,
    lease: Option<Lease>,
}

impl ResponseStream {
    pub(crate) fn new(conn: Connection, framing: Framing, keep_alive: bool, lease: Lease) -> Self {
        let (state, keep_alive) = match framing {
            Framing::Empty | Framing::Length(0) => (BodyState::Done, keep_alive),
            Framing::Length(len) => (BodyState::Length(len), keep_alive),
            Framing::Chunked => (BodyState::Chunked(ChunkedDecoder::new()), keep_alive),
            Framing::Close => (BodyState::Close, false),
        };

        let mut stream = Self {
            conn: Some(conn),
            state,
            keep_alive,
            lease: Some(lease),
        };
        if let BodyState::Done = stream.state {
            stream.finish();
        }
        stream
    }

    fn finish(&mut self) {
        self.state = BodyState::Done;
        let conn = self.conn.take();
        // the permit is released once the lease drops
        if let (Some(conn), Some(lease)) = (conn, self.lease.take()) {
            if self.keep_alive {
                lease.pool.release(&lease.endpoint, conn);
            }
        }
    }

    fn discard(&mut self) {
        self.conn = None;
        self.lease = None;
    }

    fn poll_body(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Poll::Ready(Ok(0)),
        };

        match &mut self.state {
            BodyState::Length(remaining) => {
                let max = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = ready!(Pin::new(&mut conn.io).poll_read(cx, &mut buf[..max]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed {} bytes before the end of the response body", remaining),
                    )));
                }
                *remaining -= n as u64;
                if *remaining == 0 {
                    self.state = BodyState::Done;
                }
                Poll::Ready(Ok(n))
            }
            BodyState::Chunked(decoder) => {
                let n = ready!(decoder.poll_read(Pin::new(&mut conn.io), cx, buf))?;
                if decoder.is_done() {
                    self.state = BodyState::Done;
                }
                Poll::Ready(Ok(n))
            }
            BodyState::Close => {
                let n = ready!(Pin::new(&mut conn.io).poll_read(cx, buf))?;
                if n == 0 {
                    self.state = BodyState::Done;
                }
                Poll::Ready(Ok(n))
            }
            BodyState::Done => Poll::Ready(Ok(0)),
        }
    }
}

impl AsyncRead for ResponseStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let res = ready!(this.poll_body(cx, buf));
        match res {
            Ok(_) => {
                if let BodyState::Done = this.state {
                    this.finish();
                }
            }
            Err(_) => this.discard(),
        }
        Poll::Ready(res)
    }
}
