use http::{HeaderMap, StatusCode};
use std::fmt;

use crate::body::Body;

/// How a send concluded.
///
/// Anything the server answered passes through as `Http`; every other variant means no
/// (complete) answer was obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ResponseCode {
    /// The server responded with this status.
    Http(StatusCode),
    /// The overall deadline passed before the send completed.
    RequestTimeout,
    /// The caller canceled the send.
    Canceled,
    /// The connection could not be established.
    ConnectFailure,
    /// Writing the request body failed.
    SendFailure,
    /// Reading the caller-supplied request body failed.
    StreamInputFailure,
    /// Reading the response body failed, or it ended early.
    ReceiveFailure,
    /// The response body is larger than the configured maximum.
    InsufficientStorage,
    /// Anything that could not be classified.
    UnknownFailure,
}

impl ResponseCode {
    pub fn is_http(&self) -> bool {
        matches!(self, ResponseCode::Http(_))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ResponseCode::Http(status) => Some(*status),
            _ => None,
        }
    }

    /// Failure outcomes that keep the headers the server sent.
    fn keeps_headers(&self) -> bool {
        matches!(
            self,
            ResponseCode::ReceiveFailure | ResponseCode::InsufficientStorage
        )
    }
}

impl From<StatusCode> for ResponseCode {
    fn from(status: StatusCode) -> Self {
        ResponseCode::Http(status)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ResponseCode::*;
        match self {
            Http(status) => write!(f, "{}", status),
            RequestTimeout => write!(f, "request timeout"),
            Canceled => write!(f, "canceled"),
            ConnectFailure => write!(f, "connect failure"),
            SendFailure => write!(f, "send failure"),
            StreamInputFailure => write!(f, "stream input failure"),
            ReceiveFailure => write!(f, "receive failure"),
            InsufficientStorage => write!(f, "insufficient storage"),
            UnknownFailure => write!(f, "unknown failure"),
        }
    }
}

/// A response body: nothing, fully buffered bytes, or a live stream. Never both.
#[derive(Debug)]
pub enum ResponseBody {
    Empty,
    Content(Content),
    Stream(Body),
}

/// A buffered response body.
///
/// The buffer comes from the configured allocator and may be longer than the body; only the
/// first `len()` bytes are meaningful.
#[derive(Clone, PartialEq, Eq)]
pub struct Content {
    buffer: Vec<u8>,
    length: usize,
}

impl Content {
    /// # Panics
    /// if `length` exceeds the buffer.
    pub fn new(buffer: Vec<u8>, length: usize) -> Self {
        assert!(length <= buffer.len(), "content length exceeds its buffer");
        Self { buffer, length }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The backing buffer, so pooled allocations can be handed back.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

impl From<Vec<u8>> for Content {
    fn from(buffer: Vec<u8>) -> Self {
        let length = buffer.len();
        Self { buffer, length }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content").field("length", &self.length).finish()
    }
}

#[derive(Debug)]
pub struct Response {
    code: ResponseCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    /// A response with no headers and no body. Used for every failure outcome.
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    pub(crate) fn timeout() -> Self {
        Self::new(ResponseCode::RequestTimeout)
    }

    pub(crate) fn canceled() -> Self {
        Self::new(ResponseCode::Canceled)
    }

    /// A failure that still reports the headers received before it happened.
    pub(crate) fn failure_with_headers(code: ResponseCode, headers: HeaderMap) -> Self {
        debug_assert!(code.keeps_headers());
        Self {
            code,
            headers,
            body: ResponseBody::Empty,
        }
    }

    pub(crate) fn http(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            code: ResponseCode::Http(status),
            headers,
            body,
        }
    }

    pub fn code(&self) -> ResponseCode {
        self.code
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Buffered content, if the body was buffered.
    pub fn content(&self) -> Option<&Content> {
        match &self.body {
            ResponseBody::Content(content) => Some(content),
            _ => None,
        }
    }

    pub fn has_stream(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Take the live body stream. The caller is then responsible for it.
    pub fn into_stream(self) -> Option<Body> {
        match self.body {
            ResponseBody::Stream(body) => Some(body),
            _ => None,
        }
    }

    pub fn into_parts(self) -> (ResponseCode, HeaderMap, ResponseBody) {
        (self.code, self.headers, self.body)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_content_ignores_buffer_tail() {
        let content = Content::new(vec![1, 2, 3, 0, 0], 3);
        assert_eq!(content.as_bytes(), &[1, 2, 3]);
        assert_eq!(content.len(), 3);
        assert_eq!(content.into_buffer().len(), 5);
    }

    #[test]
    fn test_failure_has_no_body() {
        let resp = Response::new(ResponseCode::ConnectFailure);
        assert!(matches!(resp.body(), ResponseBody::Empty));
        assert!(resp.headers().is_empty());
        assert!(resp.code().status().is_none());
    }

    #[test]
    fn test_code_from_status() {
        let code: ResponseCode = StatusCode::NOT_FOUND.into();
        assert!(code.is_http());
        assert_eq!(code.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(code.to_string(), "404 Not Found");
    }
}
