use crate::response::ResponseCode;
use thiserror::Error;

/// Main error type for KNXnet/IP operations
#[derive(Error, Debug)]
pub enum KnxError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{service} rejected with status 0x{status:02X}")]
    NegativeStatus { service: String, status: u8 },

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Frame invalid: {0}")]
    FrameInvalid(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid datatype: {0}")]
    InvalidDatatype(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Request already pending: {0}")]
    DuplicateExpectation(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl KnxError {
    /// Per-tag response code reported for this error
    pub fn response_code(&self) -> ResponseCode {
        match self {
            KnxError::Timeout | KnxError::DuplicateExpectation(_) => ResponseCode::RemoteBusy,
            KnxError::InvalidAddress(_) => ResponseCode::InvalidAddress,
            KnxError::InvalidDatatype(_) | KnxError::InvalidData(_) | KnxError::FrameInvalid(_) => {
                ResponseCode::InvalidDatatype
            }
            KnxError::Unsupported(_) => ResponseCode::Unsupported,
            _ => ResponseCode::InternalError,
        }
    }

    /// Whether this error was caused by an elapsed deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, KnxError::Timeout)
    }
}

/// Result type alias for KNXnet/IP operations
pub type KnxResult<T> = Result<T, KnxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_remote_busy() {
        assert_eq!(KnxError::Timeout.response_code(), ResponseCode::RemoteBusy);
        assert_eq!(
            KnxError::DuplicateExpectation("group 1/2/3".into()).response_code(),
            ResponseCode::RemoteBusy
        );
    }

    #[test]
    fn test_decode_errors_map_to_invalid_datatype() {
        assert_eq!(
            KnxError::InvalidData("short".into()).response_code(),
            ResponseCode::InvalidDatatype
        );
        assert_eq!(KnxError::NotConnected.response_code(), ResponseCode::InternalError);
    }

    #[test]
    fn test_negative_status_display() {
        let err = KnxError::NegativeStatus {
            service: "CONNECT_REQUEST".into(),
            status: 0x24,
        };
        assert_eq!(err.to_string(), "CONNECT_REQUEST rejected with status 0x24");
    }
}
