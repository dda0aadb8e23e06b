#![deny(unsafe_code)]

//! # courier
//!
//! An async HTTP/1.1 transport: it sends one request at a time over pooled connections, enforces
//! a per-call deadline independent of connection timeouts, and folds every failure into a small
//! closed set of [`ResponseCode`]s.
//!
//! ```no_run
//! use courier::{CancelToken, Request, Transport, TransportSettings};
//! use std::time::Duration;
//!
//! # fn main() -> courier::Result<()> {
//! let transport = Transport::new(TransportSettings::default());
//! let request = Request::get("http://example.org/".parse().unwrap());
//!
//! let response = smol::block_on(transport.send(
//!     &request,
//!     None,
//!     Duration::from_secs(5),
//!     &CancelToken::new(),
//! ))?;
//! println!("{}", response.code());
//! # Ok(())
//! # }
//! ```
//!
//! The library is runtime-agnostic: it never spawns tasks, and all I/O goes through the
//! `futures` traits. The default [`client::TcpConnector`] uses `smol`'s reactor for sockets.

mod body;
mod body_reader;
mod buffer_pool;
mod cancel;
mod classify;
pub mod client;
mod error;
mod handler_cache;
mod request;
mod response;
mod sender;
mod settings;
mod timeout;
mod transport;
mod util;

pub use body::Body;
pub use body_reader::LARGE_BUFFER_THRESHOLD;
pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_MAX_RETAINED, SCRATCH_BUFFER_SIZE};
pub use cancel::{CancelToken, Canceled};
pub use classify::SocketError;
pub use error::{Error, Result};
pub use handler_cache::{ConnectionHandlerCache, GlobalHandlerCache, GLOBAL_CACHE_CAPACITY, LOCAL_CACHE_CAPACITY};
pub use request::{Request, RequestContent, StreamContent};
pub use response::{Content, Response, ResponseBody, ResponseCode};
pub use sender::{HttpRequestSender, RequestSender};
pub use settings::{BufferFactory, ConnectionSettings, HandlerTuning, Proxy, StreamingPredicate, TransportSettings};
pub use transport::Transport;
