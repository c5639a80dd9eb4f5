use thiserror::Error;
use zones_ipc::IpcError;

/// Failures of daemon control calls.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The daemon handled the call and turned it down.
    #[error("daemon rejected the request (code {code}): {message}")]
    Rejected { code: i32, message: String },
    /// The call never completed: transport, timeout or connection trouble.
    #[error(transparent)]
    Ipc(IpcError),
}

impl From<IpcError> for ControlError {
    fn from(error: IpcError) -> Self {
        match error {
            IpcError::User { code, message } => ControlError::Rejected { code, message },
            other => ControlError::Ipc(other),
        }
    }
}
