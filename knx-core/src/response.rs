//! Per-tag response codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one tag within a multi-tag read, write or subscription event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Ok,
    NotFound,
    InvalidAddress,
    InvalidDatatype,
    InternalError,
    /// The remote side did not answer within the deadline
    RemoteBusy,
    Unsupported,
}

impl ResponseCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseCode::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::NotFound => "NOT_FOUND",
            ResponseCode::InvalidAddress => "INVALID_ADDRESS",
            ResponseCode::InvalidDatatype => "INVALID_DATATYPE",
            ResponseCode::InternalError => "INTERNAL_ERROR",
            ResponseCode::RemoteBusy => "REMOTE_BUSY",
            ResponseCode::Unsupported => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
