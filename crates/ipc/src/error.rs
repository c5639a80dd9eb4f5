use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::types::MethodId;

/// Errors surfaced by the IPC runtime.
///
/// The processor worker never lets a failure escape its loop: every framing
/// step and handler invocation resolves to either forward progress or one of
/// these variants delivered on the affected call or peer. Only
/// [`IpcError::Configuration`] is returned synchronously to the registering
/// thread.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to parse data received from the peer: {0}")]
    Parse(String),
    #[error("failed to serialize data for the peer: {0}")]
    Serialization(String),
    #[error("no such peer, it might have disconnected")]
    PeerDisconnected,
    #[error("peer performed a forbidden action")]
    NaughtyPeer,
    #[error("call timed out, method {method}")]
    Timeout { method: MethodId },
    #[error("peer reported an error (code {code}): {message}")]
    User { code: i32, message: String },
    #[error("socket operation failed: {errno}")]
    Socket { errno: Errno },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("the processor is shutting down")]
    Closing,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IpcError {
    /// The errno carried by [`IpcError::Socket`], if that is what this is.
    pub fn socket_errno(&self) -> Option<Errno> {
        match self {
            IpcError::Socket { errno } => Some(*errno),
            _ => None,
        }
    }
}

impl From<Errno> for IpcError {
    fn from(errno: Errno) -> Self {
        IpcError::Io(errno.into())
    }
}
