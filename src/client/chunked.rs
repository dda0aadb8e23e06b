//! `transfer-encoding: chunked`, both directions.

use futures_util::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use futures_util::ready;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Longest chunk-size or trailer line accepted.
const MAX_LINE_LENGTH: usize = 4 * 1024;

/// Incremental decoder of a chunked body.
///
/// The decoder does not own the reader; the caller passes it on every poll, so the connection
/// can be taken back once the body is done.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Size,
            line: Vec::new(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub(crate) fn poll_read<R>(
        &mut self,
        mut reader: Pin<&mut R>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>>
    where
        R: AsyncBufRead + ?Sized,
    {
        loop {
            match self.state {
                State::Size => {
                    ready!(poll_line(reader.as_mut(), cx, &mut self.line))?;
                    let size = parse_chunk_size(&self.line)?;
                    self.line.clear();
                    self.state = if size == 0 { State::Trailer } else { State::Data(size) };
                }
                State::Data(remaining) => {
                    let available = ready!(reader.as_mut().poll_fill_buf(cx))?;
                    if available.is_empty() {
                        return Poll::Ready(Err(unexpected_eof()));
                    }
                    let n = available
                        .len()
                        .min(buf.len())
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    buf[..n].copy_from_slice(&available[..n]);
                    reader.as_mut().consume(n);

                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 { State::DataEnd } else { State::Data(remaining) };
                    return Poll::Ready(Ok(n));
                }
                State::DataEnd => {
                    ready!(poll_line(reader.as_mut(), cx, &mut self.line))?;
                    if trim_line(&self.line) != b"" {
                        return Poll::Ready(Err(invalid("missing CRLF after chunk data")));
                    }
                    self.line.clear();
                    self.state = State::Size;
                }
                State::Trailer => {
                    // trailers are read and discarded
                    ready!(poll_line(reader.as_mut(), cx, &mut self.line))?;
                    let done = trim_line(&self.line).is_empty();
                    self.line.clear();
                    if done {
                        self.state = State::Done;
                    }
                }
                State::Done => return Poll::Ready(Ok(0)),
            }
        }
    }
}

/// Accumulate one line, up to and including `\n`, into `line`.
fn poll_line<R>(mut reader: Pin<&mut R>, cx: &mut Context<'_>, line: &mut Vec<u8>) -> Poll<io::Result<()>>
where
    R: AsyncBufRead + ?Sized,
{
    loop {
        let available = ready!(reader.as_mut().poll_fill_buf(cx))?;
        if available.is_empty() {
            return Poll::Ready(Err(unexpected_eof()));
        }

        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..used]);
        reader.as_mut().consume(used);

        if line.len() > MAX_LINE_LENGTH {
            return Poll::Ready(Err(invalid("chunk line too long")));
        }
        if done {
            return Poll::Ready(Ok(()));
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = trim_line(line);
    // chunk extensions are ignored
    let size = match line.iter().position(|b| *b == b';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let size = std::str::from_utf8(size)
        .map_err(|_| invalid("chunk size is not ascii"))?
        .trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid("invalid chunk size"))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn unexpected_eof() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed before the chunked body ended",
    )
}

/// Write one chunk. Empty data is skipped, since an empty chunk would end the body.
pub(crate) async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.is_empty() {
        return Ok(());
    }
    writer.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await
}

pub(crate) async fn write_last_chunk<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(b"0\r\n\r\n").await
}
