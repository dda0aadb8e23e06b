use std::error::Error as StdError;
use std::fmt;

use crate::cancel::Canceled;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure raised by a connection handler.
///
/// The transport never hands these to callers; they are classified into a
/// [`ResponseCode`](crate::ResponseCode). The source chain is what classification looks at, so
/// keep the original `io::Error` as the source instead of formatting it away.
#[derive(Debug)]
pub struct ClientError {
    kind: Kind,
    source: Option<BoxError>,
}

impl ClientError {
    pub(crate) fn new<E: Into<BoxError>>(kind: Kind, err: Option<E>) -> Self {
        Self {
            kind,
            source: err.map(Into::into),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The operation was abandoned through its cancel token.
    pub fn canceled() -> Self {
        ClientError::new(Kind::Canceled, Some(Canceled::new()))
    }

    /// The request body stream had already been read by an earlier send.
    pub fn stream_already_used() -> Self {
        ClientError::new(Kind::StreamAlreadyUsed, None::<ClientError>)
    }

    /// Reading the caller's request body stream failed.
    pub fn stream_input<E: Into<BoxError>>(err: E) -> Self {
        ClientError::new(Kind::StreamInput, Some(err))
    }

    /// Writing the request body to the connection failed.
    pub fn body_send<E: Into<BoxError>>(err: E) -> Self {
        ClientError::new(Kind::BodySend, Some(err))
    }

    /// The request could not be exchanged: connecting, writing the head, or reading the
    /// response head failed.
    pub fn request<E: Into<BoxError>>(err: E) -> Self {
        ClientError::new(Kind::Request, Some(err))
    }

    pub fn decode<S: Into<String>>(msg: S) -> Self {
        ClientError::new(Kind::Decode, Some(msg.into()))
    }

    pub fn decode_err<E: Into<BoxError>>(err: E) -> Self {
        ClientError::new(Kind::Decode, Some(err))
    }

    pub fn encode<S: Into<String>>(msg: S) -> Self {
        ClientError::new(Kind::Encode, Some(msg.into()))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Kind::*;
        let msg = match self.kind {
            Canceled => "Canceled",
            StreamAlreadyUsed => "Request body stream already used",
            StreamInput => "Failed reading request body stream",
            BodySend => "Failed sending request body",
            Request => "Request failed",
            Encode => "Encode error",
            Decode => "Decode error",
        };
        if let Some(ref err) = self.source {
            write!(f, "{}: {}", msg, err)
        } else {
            write!(f, "{}", msg)
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Canceled,
    StreamAlreadyUsed,
    StreamInput,
    BodySend,
    Request,
    Encode,
    Decode,
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|e| &**e as _)
    }
}
