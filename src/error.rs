use std::fmt;
use std::io;

use thiserror::Error;

use crate::device::controller::DeviceState;

pub type Result<T, E = E502Error> = std::result::Result<T, E>;

/// Status code reported by the module in every control response.
///
/// Zero means success. Anything else is passed through to the caller untouched,
/// the driver never retries or interprets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Escalate a non-zero device code into an [`E502Error::Device`]
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(E502Error::Device(self))
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x})", self.0, self.0)
    }
}

#[derive(Error, Debug)]
pub enum E502Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Channel settings cannot be encoded: {0}")]
    InvalidSettings(String),

    #[error("Request payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Expected response of {len} bytes exceeds the {max} byte limit")]
    ResponseTooLarge { len: usize, max: usize },

    #[error("Hardware info must be exactly 4 bytes, got {0}")]
    InvalidHardwareData(usize),

    #[error("Malformed calibration data: {0}")]
    InvalidCalibrationData(String),

    #[error("Operation `{operation}` is not allowed while the device is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DeviceState,
    },

    #[error("Device reported error code {0}")]
    Device(ErrorCode),

    #[error("Connection to the module was closed")]
    ConnectionClosed,

    /// Request/response framing on the control connection is lost
    #[error("Control connection out of sync: {0}")]
    Desynchronized(String),

    #[error("I/O error while talking to the module: {0}")]
    Io(io::Error),
}

impl From<io::Error> for E502Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => E502Error::ConnectionClosed,
            _ => E502Error::Io(value),
        }
    }
}

impl E502Error {
    /// Errors after which the channel must be reconnected rather than reused
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            E502Error::ConnectionClosed | E502Error::Desynchronized(_) | E502Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_peer_kinds_become_connection_closed() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
        ] {
            let err: E502Error = io::Error::from(kind).into();
            assert!(matches!(err, E502Error::ConnectionClosed));
            assert!(err.is_transport());
        }

        let err: E502Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, E502Error::Io(_)));
        assert!(E502Error::Desynchronized("lost".to_owned()).is_transport());
        assert!(!E502Error::InvalidArgument("bad".to_owned()).is_transport());
    }

    #[test]
    fn error_code_escalation() {
        assert!(ErrorCode::OK.into_result().is_ok());
        assert!(matches!(
            ErrorCode(-3).into_result(),
            Err(E502Error::Device(ErrorCode(-3)))
        ));
    }
}
