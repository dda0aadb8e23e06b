use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Public Errors.
///
/// Expected network conditions never surface here; they are folded into a
/// [`ResponseCode`](crate::ResponseCode). What remains is misuse by the caller.
#[derive(ThisError, Debug)]
pub enum Error {
    /// A request whose body is a one-shot stream was sent a second time.
    #[error("Request body stream has already been consumed by a previous send")]
    StreamAlreadyUsed,
}
