use crate::backend::{BackendError, ThreadId};
use crate::dap::protocol::{DecodeError, ErrorMessage, ErrorResponseBody};
use crate::dap::transport::TransportError;
use crate::session::state::SessionState;
use std::time::Duration;
use strum_macros::Display;

/// Failure classes, each has its own id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorClass {
    Protocol,
    Configuration,
    State,
    Runtime,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    // --------------------------------- protocol errors ---------------------------------
    #[error("unrecognized request `{0}`")]
    UnknownCommand(String),
    #[error("invalid arguments for `{command}`: {reason}")]
    InvalidArguments { command: String, reason: String },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("request seq {seq} is not greater than the previous request seq {last}")]
    SequenceViolation { seq: i64, last: i64 },

    // ------------------------------- configuration errors -------------------------------
    #[error("debug adapter only supports native paths, `pathFormat: {0}` is not supported")]
    UnsupportedPathFormat(String),
    #[error("invalid process id `{0}`")]
    InvalidProcessId(String),
    #[error("invalid launch configuration: {0}")]
    InvalidLaunch(String),

    // ---------------------------------- state errors ----------------------------------
    #[error("`{command}` is not valid while the session is {state}, expected {expected}")]
    InvalidState {
        command: &'static str,
        state: SessionState,
        expected: String,
    },
    #[error("thread {0} is not stopped")]
    ThreadNotStopped(ThreadId),
    #[error("thread {0} is already stopped")]
    ThreadAlreadyStopped(ThreadId),
    #[error("breakpoints of {0} are being updated by another request")]
    BreakpointsInFlight(String),

    // --------------------------------- runtime errors ---------------------------------
    #[error("debuggee failed to start: {0}")]
    StartFailed(BackendError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend did not answer `{operation}` within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("unknown or stale frame id {0}")]
    UnknownFrame(i64),
    #[error("unknown or stale variables reference {0}")]
    UnknownReference(i64),
    #[error("`{0}` panicked")]
    Panicked(&'static str),

    // ---------------------------------- fatal errors ----------------------------------
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdapterError {
    /// Stable id sent as `body.error.id`.
    pub fn code(&self) -> u32 {
        match self {
            AdapterError::UnknownCommand(_) => 1001,
            AdapterError::InvalidArguments { .. } => 1002,
            AdapterError::MalformedMessage(_) => 1003,
            AdapterError::SequenceViolation { .. } => 1004,
            AdapterError::UnsupportedPathFormat(_) => 2001,
            AdapterError::InvalidProcessId(_) => 2002,
            AdapterError::InvalidLaunch(_) => 2003,
            AdapterError::InvalidState { .. } => 3001,
            AdapterError::ThreadNotStopped(_) => 3002,
            AdapterError::ThreadAlreadyStopped(_) => 3003,
            AdapterError::BreakpointsInFlight(_) => 3004,
            AdapterError::StartFailed(_) => 4001,
            AdapterError::Backend(_) => 4002,
            AdapterError::Timeout { .. } => 4003,
            AdapterError::ProcessNotFound(_) => 4004,
            AdapterError::UnknownFrame(_) => 4005,
            AdapterError::UnknownReference(_) => 4006,
            AdapterError::Panicked(_) => 4007,
            AdapterError::Transport(_) => 5001,
            AdapterError::Internal(_) => 5002,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.code() / 1000 {
            1 => ErrorClass::Protocol,
            2 => ErrorClass::Configuration,
            3 => ErrorClass::State,
            4 => ErrorClass::Runtime,
            _ => ErrorClass::Fatal,
        }
    }

    /// Fatal errors end the session, everything else becomes an error response.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub fn to_body(&self) -> ErrorResponseBody {
        ErrorResponseBody {
            error: ErrorMessage {
                id: self.code(),
                format: self.to_string(),
            },
        }
    }
}

impl From<DecodeError> for AdapterError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnknownCommand(cmd) => AdapterError::UnknownCommand(cmd),
            DecodeError::InvalidArguments { command, reason } => {
                AdapterError::InvalidArguments { command, reason }
            }
            e @ (DecodeError::InvalidJson(_)
            | DecodeError::MissingField(_)
            | DecodeError::UnexpectedType(_)) => AdapterError::MalformedMessage(e.to_string()),
        }
    }
}
