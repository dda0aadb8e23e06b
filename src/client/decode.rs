#![allow(clippy::borrow_interior_mutable_const)]

use futures_util::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    Method, StatusCode, Version,
};
use tracing::trace;

use super::ClientError;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const MAX_HEADERS: usize = 128;

/// Status line and headers of a response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the connection may carry another request after this response.
    pub(crate) fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .collect::<Vec<_>>();

        if self.version == Version::HTTP_10 {
            connection.iter().any(|v| v.eq_ignore_ascii_case("keep-alive"))
        } else {
            !connection.iter().any(|v| v.eq_ignore_ascii_case("close"))
        }
    }

    /// Interim responses are skipped; another head follows them.
    pub(crate) fn is_interim(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }
}

/// How the end of a response body is found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Framing {
    Empty,
    Length(u64),
    Chunked,
    /// The body runs until the server closes the connection.
    Close,
}

/// Decode an HTTP response head.
///
/// `None` means the connection was closed before any byte of a response arrived.
pub(crate) async fn read_head<R>(reader: &mut R, max_head_length: usize) -> Result<Option<ResponseHead>, ClientError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut buf = Vec::new();

    // Keep reading bytes from the stream until we hit the end of the head. A single line is
    // never read past the remaining budget.
    loop {
        let budget = max_head_length.saturating_sub(buf.len()).max(1) as u64;
        let bytes_read = (&mut *reader)
            .take(budget)
            .read_until(LF, &mut buf)
            .await
            .map_err(ClientError::request)?;

        // No more bytes are yielded from the stream.
        if bytes_read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ClientError::decode("Connection closed in the middle of the response head"));
        }

        // Prevent CWE-400 DDOS with large HTTP Headers.
        if buf.len() >= max_head_length {
            return Err(ClientError::decode(format!(
                "Response head exceeds {} bytes",
                max_head_length
            )));
        }

        // We've hit the end delimiter of the head.
        let idx = buf.len() - 1;
        if idx >= 3 && buf[idx - 3..=idx] == [CR, LF, CR, LF] {
            break;
        }
        if idx >= 1 && buf[idx - 1..=idx] == [LF, LF] {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut httparse_res = httparse::Response::new(&mut headers);

    // Convert our header buf into an httparse instance, and validate.
    let status = httparse_res.parse(&buf).map_err(ClientError::decode_err)?;
    if status.is_partial() {
        return Err(ClientError::decode("Malformed HTTP head"));
    };

    let code = httparse_res
        .code
        .ok_or_else(|| ClientError::decode("No status code found"))?;
    trace!("< HTTP/1.{} {}", httparse_res.version.unwrap_or(1), code);

    let version = match httparse_res.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(ClientError::decode("Unsupported HTTP version")),
    };

    let mut headers = HeaderMap::new();
    for header in httparse_res.headers.iter() {
        let value = HeaderValue::from_bytes(header.value).map_err(ClientError::decode_err)?;
        let name: HeaderName = header.name.parse().map_err(ClientError::decode_err)?;
        headers.append(name, value);
    }

    Ok(Some(ResponseHead {
        status: StatusCode::from_u16(code).map_err(ClientError::decode_err)?,
        version,
        headers,
    }))
}

/// Work out how the body following `head` is delimited, for a request made with `method`.
pub(crate) fn framing(method: &Method, head: &ResponseHead) -> Result<Framing, ClientError> {
    let status = head.status;
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }

    let content_length = head.headers.get(CONTENT_LENGTH);
    let transfer_encoding = head.headers.get_all(TRANSFER_ENCODING).iter().last();

    if content_length.is_some() && transfer_encoding.is_some() {
        return Err(ClientError::decode("Unexpected Content-Length header"));
    };

    if let Some(encoding) = transfer_encoding {
        let chunked = encoding
            .to_str()
            .ok()
            .and_then(|v| v.rsplit(',').next())
            .map_or(false, |v| v.trim().eq_ignore_ascii_case("chunked"));
        return Ok(if chunked { Framing::Chunked } else { Framing::Close });
    }

    if let Some(len) = content_length {
        let len = len
            .to_str()
            .map_err(ClientError::decode_err)?
            .trim()
            .parse::<u64>()
            .map_err(ClientError::decode_err)?;
        return Ok(Framing::Length(len));
    }

    Ok(Framing::Close)
}
