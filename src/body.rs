use futures_util::io::{self, AsyncBufRead, AsyncRead, AsyncReadExt, Cursor};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Declared lengths are not trusted beyond this for up-front allocation.
const PREALLOCATE_LIMIT: u64 = 64 * 1024;

pin_project_lite::pin_project! {
    /// A streaming response body.
    ///
    /// When a response is streamed, the `Body` owns the underlying connection. Reading it to the
    /// end hands the connection back to its pool; dropping it early closes the connection.
    pub struct Body {
        #[pin]
        pub(crate) reader: Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>,
        pub(crate) length: Option<u64>,
    }
}

impl Body {
    /// Create an empty Body
    pub fn empty() -> Self {
        Self {
            reader: Box::new(io::empty()),
            length: Some(0),
        }
    }

    /// Create a Body from a type implementing AsyncBufRead
    ///
    /// `len` is the declared length of the stream, if known.
    pub fn from_reader(
        reader: impl AsyncBufRead + Unpin + Send + Sync + 'static,
        len: Option<u64>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            length: len,
        }
    }

    /// Create a Body from bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            length: Some(bytes.len() as u64),
            reader: Box::new(Cursor::new(bytes)),
        }
    }

    /// Declared length of the body, if the server sent one.
    pub fn len(&self) -> Option<u64> {
        self.length
    }

    /// Read a Body into bytes. Consumes Body.
    pub async fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length.unwrap_or(0).min(PREALLOCATE_LIMIT) as usize);
        self.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Read a Body into a String. Consumes Body.
    pub async fn into_string(mut self) -> io::Result<String> {
        let mut buf = String::with_capacity(self.length.unwrap_or(0).min(PREALLOCATE_LIMIT) as usize);
        self.read_to_string(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl<'a> From<&'a str> for Body {
    fn from(s: &'a str) -> Self {
        Self::from_bytes(s.as_bytes().to_vec())
    }
}

impl AsyncRead for Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncBufRead for Body {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&'_ [u8]>> {
        let this = self.project();
        this.reader.poll_fill_buf(cx)
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.reader).consume(amt)
    }
}
