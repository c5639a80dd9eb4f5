use std::fmt::Display;
use std::io;

use thiserror::Error;

/// Failures of the binary codec. `Message` carries everything produced by
/// derived `Serialize`/`Deserialize` impls, including unknown union tags.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("string field is not valid utf-8")]
    Utf8,
    #[error("scalar is not a valid char")]
    InvalidChar,
    #[error("length does not fit the 32-bit wire prefix")]
    LengthOverflow,
    #[error("sequence length must be known up front")]
    UnsizedSequence,
    #[error("type cannot be represented on the wire: {0}")]
    Unsupported(&'static str),
    #[error("file descriptors can only travel over a socket")]
    FdUnsupported,
    #[error("expected a file descriptor in the ancillary data")]
    FdExpected,
}

impl Error {
    /// Whether the failure happened because the peer went away rather than
    /// because the bytes were malformed.
    pub(crate) fn is_disconnection(&self) -> bool {
        matches!(
            self,
            Error::Io(io) if matches!(
                io.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

impl serde::ser::Error for Error {
    fn custom<T: Display>(message: T) -> Self {
        Error::Message(message.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T: Display>(message: T) -> Self {
        Error::Message(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
