//! Transport layer for KNXnet/IP
//!
//! Provides the byte-stream view over a datagram socket that the message
//! framer consumes.

pub mod error;
pub mod transport;
pub mod udp;

pub use error::{KnxError, KnxResult};
pub use transport::Transport;
pub use udp::{MAX_UDP_PAYLOAD_SIZE, UdpSettings, UdpTransport};
