//! Error types for the transport layer

pub use knx_core::error::{KnxError, KnxResult};
