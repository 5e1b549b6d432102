//! Device management over a tunnel
//!
//! Property, property description and memory reads use connection-oriented
//! transport layer communication with the target device. [`DeviceRegistry`]
//! owns the open [`DeviceSession`]s of one tunnel.

pub mod family;
pub mod registry;
pub mod session;

pub use family::DeviceFamily;
pub use registry::DeviceRegistry;
pub use session::{DEFAULT_MAX_APDU, DeviceSession, MAX_APDU_CEILING, PropertyValue};
