use runlink_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("too many processes (limit {0})")]
    TooManyProcesses(u32),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Errors a client caused by sending something invalid for the current
    /// state. These are reported back without any other state changing.
    pub fn is_client_error(&self) -> bool {
        matches!(self, RunError::BadMessage(_) | RunError::InvalidOperation(_))
    }

    pub fn bad_message(reason: impl Into<String>) -> Self {
        RunError::BadMessage(reason.into())
    }

    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        RunError::InvalidOperation(reason.into())
    }
}

impl From<ProtocolError> for RunError {
    fn from(err: ProtocolError) -> Self {
        RunError::BadMessage(err.to_string())
    }
}

impl From<nix::Error> for RunError {
    fn from(err: nix::Error) -> Self {
        RunError::Io(std::io::Error::from(err))
    }
}
