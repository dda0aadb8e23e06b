use futures_util::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use http::header::{self, HeaderMap};
use http::{Method, Uri};
use std::io;
use std::sync::Arc;
use tracing::trace;

use super::chunked::{write_chunk, write_last_chunk};
use super::ClientError;
use crate::buffer_pool::BufferPool;
use crate::request::{BodyReader, Request, RequestContent};

/// The wire-level request built from a [`Request`] for one send attempt.
pub struct OutgoingRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: OutgoingBody,
}

pub enum OutgoingBody {
    Empty,
    Bytes(Arc<[u8]>),
    Stream {
        reader: BodyReader,
        length: Option<u64>,
    },
}

impl OutgoingBody {
    /// Another copy of the body, unless it is a one-shot stream.
    pub fn try_clone(&self) -> Option<OutgoingBody> {
        match self {
            OutgoingBody::Empty => Some(OutgoingBody::Empty),
            OutgoingBody::Bytes(bytes) => Some(OutgoingBody::Bytes(bytes.clone())),
            OutgoingBody::Stream { .. } => None,
        }
    }

    fn length(&self) -> Option<u64> {
        match self {
            OutgoingBody::Empty => Some(0),
            OutgoingBody::Bytes(bytes) => Some(bytes.len() as u64),
            OutgoingBody::Stream { length, .. } => *length,
        }
    }
}

impl OutgoingRequest {
    /// Build the outgoing request. Taking a streamed body fails if an earlier send already
    /// consumed it.
    pub fn from_request(request: &Request) -> Result<Self, ClientError> {
        let body = match request.content() {
            None => OutgoingBody::Empty,
            Some(RequestContent::Bytes(bytes)) => OutgoingBody::Bytes(bytes.clone()),
            Some(RequestContent::Stream(stream)) => OutgoingBody::Stream {
                reader: stream.take().map_err(|_| ClientError::stream_already_used())?,
                length: stream.length(),
            },
        };

        Ok(Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            body,
        })
    }

    pub(crate) fn try_clone(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
        })
    }
}

/// Serialize the request line and headers.
///
/// `absolute_form` is set when talking to a proxy, which needs the full uri as request target.
pub(crate) fn encode_head(req: &OutgoingRequest, absolute_form: bool) -> Result<Vec<u8>, ClientError> {
    let mut buf: Vec<u8> = Vec::with_capacity(256);

    let target = if absolute_form {
        req.uri.to_string()
    } else {
        // clients are not supposed to send uri frags
        req.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned())
    };

    let val = format!("{} {} HTTP/1.1\r\n", req.method, target);
    trace!("> {}", val.trim_end());
    buf.extend_from_slice(val.as_bytes());

    if !req.headers.contains_key(header::HOST) {
        let host = req
            .uri
            .authority()
            .ok_or_else(|| ClientError::encode("Missing hostname"))?;
        let val = format!("host: {}\r\n", host);
        trace!("> {}", val.trim_end());
        buf.extend_from_slice(val.as_bytes());
    }

    // framing headers are ours; the caller's are dropped below
    match req.body.length() {
        Some(0) if !expects_body(&req.method) => {}
        Some(len) => {
            let val = format!("content-length: {}\r\n", len);
            trace!("> {}", val.trim_end());
            buf.extend_from_slice(val.as_bytes());
        }
        None => {
            trace!("> transfer-encoding: chunked");
            buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
    }

    for (name, value) in req.headers.iter() {
        if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        // written broken up, because value may contain opaque bytes.
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

fn expects_body(method: &Method) -> bool {
    method == Method::POST || method == Method::PUT || method == Method::PATCH
}

/// Write the request body.
///
/// Read failures on the caller's stream and write failures on the connection are reported
/// separately, so they classify differently.
pub(crate) async fn write_body<W>(writer: &mut W, body: OutgoingBody) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match body {
        OutgoingBody::Empty => Ok(()),
        OutgoingBody::Bytes(bytes) => writer.write_all(&bytes).await.map_err(ClientError::body_send),
        OutgoingBody::Stream {
            mut reader,
            length: Some(length),
        } => {
            let mut buf = BufferPool::shared().acquire();
            let mut remaining = length;
            while remaining > 0 {
                let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                let n = reader
                    .read(&mut buf[..want])
                    .await
                    .map_err(ClientError::stream_input)?;
                if n == 0 {
                    return Err(ClientError::stream_input(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("request body stream ended {} bytes short of its declared length", remaining),
                    )));
                }
                writer.write_all(&buf[..n]).await.map_err(ClientError::body_send)?;
                remaining -= n as u64;
            }
            Ok(())
        }
        OutgoingBody::Stream {
            mut reader,
            length: None,
        } => {
            let mut buf = BufferPool::shared().acquire();
            loop {
                let n = reader.read(&mut buf[..]).await.map_err(ClientError::stream_input)?;
                if n == 0 {
                    break;
                }
                write_chunk(writer, &buf[..n]).await.map_err(ClientError::body_send)?;
            }
            write_last_chunk(writer).await.map_err(ClientError::body_send)
        }
    }
}
