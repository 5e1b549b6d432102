//! Error types for the session layer

pub use knx_core::error::{KnxError, KnxResult};
