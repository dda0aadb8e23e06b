//! Mapping handler failures onto the outcome taxonomy.

use std::error::Error as StdError;
use std::io;
use thiserror::Error as ThisError;
use tracing::{debug, error, warn};

use crate::cancel::Canceled;
use crate::client::{ClientError, Kind};
use crate::response::ResponseCode;

/// Connection-level socket failures that mean "could not reach the server".
#[derive(ThisError, Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketError {
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("network down")]
    NetworkDown,
    #[error("host down")]
    HostDown,
    #[error("host not found")]
    HostNotFound,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("address already in use")]
    AddressAlreadyInUse,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection reset")]
    ConnectionReset,
    #[error("timed out")]
    TimedOut,
    #[error("try again")]
    TryAgain,
    #[error("system not ready")]
    SystemNotReady,
    #[error("too many open sockets")]
    TooManyOpenSockets,
    #[error("no buffer space available")]
    NoBufferSpaceAvailable,
    #[error("destination address required")]
    DestinationAddressRequired,
}

impl SocketError {
    /// Recognize a socket failure in `err`: an embedded `SocketError`, then the raw OS code,
    /// then the portable error kind.
    pub fn from_io(err: &io::Error) -> Option<SocketError> {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<SocketError>()) {
            return Some(*inner);
        }
        if let Some(socket) = err.raw_os_error().and_then(Self::from_os_code) {
            return Some(socket);
        }
        Self::from_kind(err.kind())
    }

    #[cfg(unix)]
    fn from_os_code(code: i32) -> Option<SocketError> {
        use SocketError::*;
        let socket = match code {
            libc::EHOSTUNREACH => HostUnreachable,
            libc::ENETUNREACH => NetworkUnreachable,
            libc::ENETDOWN => NetworkDown,
            libc::EHOSTDOWN => HostDown,
            libc::EADDRNOTAVAIL => AddressNotAvailable,
            libc::EADDRINUSE => AddressAlreadyInUse,
            libc::ECONNREFUSED => ConnectionRefused,
            libc::ECONNABORTED => ConnectionAborted,
            libc::ECONNRESET => ConnectionReset,
            libc::ETIMEDOUT => TimedOut,
            libc::EAGAIN => TryAgain,
            libc::EMFILE | libc::ENFILE => TooManyOpenSockets,
            libc::ENOBUFS => NoBufferSpaceAvailable,
            libc::EDESTADDRREQ => DestinationAddressRequired,
            _ => return None,
        };
        Some(socket)
    }

    #[cfg(windows)]
    fn from_os_code(code: i32) -> Option<SocketError> {
        use SocketError::*;
        let socket = match code {
            10065 => HostUnreachable,
            10051 => NetworkUnreachable,
            10050 => NetworkDown,
            10064 => HostDown,
            11001 => HostNotFound,
            10049 => AddressNotAvailable,
            10048 => AddressAlreadyInUse,
            10061 => ConnectionRefused,
            10053 => ConnectionAborted,
            10054 => ConnectionReset,
            10060 => TimedOut,
            11002 | 10035 => TryAgain,
            10091 => SystemNotReady,
            10024 => TooManyOpenSockets,
            10055 => NoBufferSpaceAvailable,
            10039 => DestinationAddressRequired,
            _ => return None,
        };
        Some(socket)
    }

    #[cfg(not(any(unix, windows)))]
    fn from_os_code(_code: i32) -> Option<SocketError> {
        None
    }

    fn from_kind(kind: io::ErrorKind) -> Option<SocketError> {
        use io::ErrorKind;
        use SocketError::*;
        let socket = match kind {
            ErrorKind::HostUnreachable => HostUnreachable,
            ErrorKind::NetworkUnreachable => NetworkUnreachable,
            ErrorKind::NetworkDown => NetworkDown,
            ErrorKind::AddrNotAvailable => AddressNotAvailable,
            ErrorKind::AddrInUse => AddressAlreadyInUse,
            ErrorKind::ConnectionRefused => ConnectionRefused,
            ErrorKind::ConnectionAborted => ConnectionAborted,
            ErrorKind::ConnectionReset => ConnectionReset,
            ErrorKind::TimedOut => TimedOut,
            ErrorKind::WouldBlock => TryAgain,
            _ => return None,
        };
        Some(socket)
    }
}

/// Whether the source chain of `err` holds a recognized socket failure or a cancellation.
fn is_connect_failure(err: &ClientError) -> bool {
    let mut next: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = next {
        if cause.is::<Canceled>() || cause.is::<SocketError>() {
            return true;
        }
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            if SocketError::from_io(io).is_some() {
                return true;
            }
            // io::Error::source skips the wrapped error itself
            if let Some(inner) = io.get_ref() {
                next = Some(inner as &(dyn StdError + 'static));
                continue;
            }
        }
        next = cause.source();
    }
    false
}

/// Classify a handler failure for a request to `target`.
///
/// `None` means the failure is a caller contract violation that must surface as an error
/// instead of an outcome.
pub(crate) fn classify(err: &ClientError, cancellation_requested: bool, target: &str) -> Option<ResponseCode> {
    if cancellation_requested {
        debug!(authority = %target, error = %err, "Request canceled");
        return Some(ResponseCode::Canceled);
    }

    let code = match err.kind() {
        Kind::Canceled => {
            debug!(authority = %target, "Request canceled");
            ResponseCode::Canceled
        }
        Kind::StreamAlreadyUsed => return None,
        Kind::StreamInput => {
            error!(authority = %target, error = %err, "Failed reading request body stream");
            ResponseCode::StreamInputFailure
        }
        Kind::BodySend => {
            error!(authority = %target, error = %err, "Failed sending request body");
            ResponseCode::SendFailure
        }
        Kind::Request if is_connect_failure(err) => {
            warn!(authority = %target, error = %err, "Connection failure");
            ResponseCode::ConnectFailure
        }
        _ => {
            error!(authority = %target, error = ?err, "Unknown failure");
            ResponseCode::UnknownFailure
        }
    };
    Some(code)
}

#[cfg(test)]
mod test {
    use super::*;

    const TARGET: &str = "example.org:80";

    fn request_error(err: io::Error) -> ClientError {
        ClientError::request(err)
    }

    #[test]
    fn test_socket_errors_are_connect_failures() {
        use SocketError::*;
        let all = [
            HostUnreachable,
            NetworkUnreachable,
            NetworkDown,
            HostDown,
            HostNotFound,
            AddressNotAvailable,
            AddressAlreadyInUse,
            ConnectionRefused,
            ConnectionAborted,
            ConnectionReset,
            TimedOut,
            TryAgain,
            SystemNotReady,
            TooManyOpenSockets,
            NoBufferSpaceAvailable,
            DestinationAddressRequired,
        ];
        for socket in all.iter() {
            let err = request_error(io::Error::new(io::ErrorKind::Other, *socket));
            assert_eq!(
                classify(&err, false, TARGET),
                Some(ResponseCode::ConnectFailure),
                "{:?}",
                socket
            );
        }
    }

    #[test]
    fn test_error_kinds_are_connect_failures() {
        let kinds = [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut,
            io::ErrorKind::AddrNotAvailable,
            io::ErrorKind::HostUnreachable,
        ];
        for kind in kinds.iter() {
            let err = request_error(io::Error::from(*kind));
            assert_eq!(classify(&err, false, TARGET), Some(ResponseCode::ConnectFailure));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_raw_os_codes() {
        let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(SocketError::from_io(&err), Some(SocketError::ConnectionRefused));

        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(SocketError::from_io(&err), Some(SocketError::TooManyOpenSockets));

        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(SocketError::from_io(&err), None);
    }

    #[test]
    fn test_nested_socket_error() {
        // io error wrapping an io error wrapping the socket error
        let inner = io::Error::new(io::ErrorKind::Other, SocketError::HostNotFound);
        let outer = io::Error::new(io::ErrorKind::Other, inner);
        let err = request_error(outer);
        assert_eq!(classify(&err, false, TARGET), Some(ResponseCode::ConnectFailure));
    }

    #[test]
    fn test_wrapped_cancellation_is_connect_failure() {
        let err = ClientError::request(Canceled::new());
        assert_eq!(classify(&err, false, TARGET), Some(ResponseCode::ConnectFailure));
    }

    #[test]
    fn test_unrecognized_socket_error() {
        let err = request_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(classify(&err, false, TARGET), Some(ResponseCode::UnknownFailure));

        let err = ClientError::decode("garbage");
        assert_eq!(classify(&err, false, TARGET), Some(ResponseCode::UnknownFailure));
    }

    #[test]
    fn test_cancellation_wins() {
        let err = ClientError::body_send(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(classify(&err, true, TARGET), Some(ResponseCode::Canceled));
        assert_eq!(classify(&err, false, TARGET), Some(ResponseCode::SendFailure));

        let err = request_error(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(classify(&err, true, TARGET), Some(ResponseCode::Canceled));
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            classify(&ClientError::canceled(), false, TARGET),
            Some(ResponseCode::Canceled)
        );
        assert_eq!(classify(&ClientError::stream_already_used(), false, TARGET), None);
        assert_eq!(
            classify(
                &ClientError::stream_input(io::Error::from(io::ErrorKind::Other)),
                false,
                TARGET
            ),
            Some(ResponseCode::StreamInputFailure)
        );
    }
}
