use futures_util::io::AsyncRead;
use http::{header::HeaderName, HeaderMap, HeaderValue, Method, Uri};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::Error;

/// An outgoing request, immutable for the duration of a send.
///
/// Cloning is cheap: in-memory content is shared, and a streamed body is shared as well (it can
/// still only be sent once across all clones).
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    content: Option<RequestContent>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            content: None,
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: Uri) -> Self {
        Self::new(Method::POST, uri)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Attach an in-memory body.
    pub fn with_content(mut self, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.content = Some(RequestContent::Bytes(bytes.into()));
        self
    }

    /// Attach a streamed body. `length`, if given, is sent as `content-length`; otherwise the
    /// body is sent chunked.
    pub fn with_stream(
        mut self,
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
        length: Option<u64>,
    ) -> Self {
        self.content = Some(RequestContent::Stream(StreamContent::new(reader, length)));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content(&self) -> Option<&RequestContent> {
        self.content.as_ref()
    }
}

#[derive(Clone, Debug)]
pub enum RequestContent {
    Bytes(Arc<[u8]>),
    Stream(StreamContent),
}

impl RequestContent {
    pub fn length(&self) -> Option<u64> {
        match self {
            RequestContent::Bytes(bytes) => Some(bytes.len() as u64),
            RequestContent::Stream(stream) => stream.length,
        }
    }
}

pub type BodyReader = Box<dyn AsyncRead + Unpin + Send + Sync + 'static>;

/// A one-shot body stream.
#[derive(Clone)]
pub struct StreamContent {
    reader: Arc<Mutex<Option<BodyReader>>>,
    length: Option<u64>,
}

impl StreamContent {
    fn new(reader: impl AsyncRead + Unpin + Send + Sync + 'static, length: Option<u64>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
            length,
        }
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Take the stream for sending. Fails if any clone of this content was already sent.
    pub(crate) fn take(&self) -> Result<BodyReader, Error> {
        self.reader
            .lock()
            .expect("stream content poisoned")
            .take()
            .ok_or(Error::StreamAlreadyUsed)
    }
}

impl fmt::Debug for StreamContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContent")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stream_taken_once_across_clones() {
        let req = Request::post(Uri::from_static("http://example.org/"))
            .with_stream(futures_util::io::Cursor::new(vec![1u8, 2, 3]), Some(3));
        let copy = req.clone();

        let stream = match req.content() {
            Some(RequestContent::Stream(stream)) => stream,
            _ => panic!("expected stream content"),
        };
        assert!(stream.take().is_ok());

        match copy.content() {
            Some(RequestContent::Stream(stream)) => {
                assert!(matches!(stream.take(), Err(Error::StreamAlreadyUsed)))
            }
            _ => panic!("expected stream content"),
        }
    }

    #[test]
    fn test_content_length() {
        let req = Request::post(Uri::from_static("http://example.org/")).with_content(&b"parcel"[..]);
        assert_eq!(req.content().and_then(RequestContent::length), Some(6));
    }
}
