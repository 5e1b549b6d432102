//! Session layer for KNXnet/IP
//!
//! This crate provides the KNXnet/IP message model, the framer that cuts
//! messages out of the transport buffer, the correlator that pairs requests
//! with their responses and the tunneling session built on top of them.

pub mod codec;
pub mod correlator;
pub mod dib;
pub mod error;
pub mod message;
pub mod tunnel;

#[cfg(test)]
mod test_support;

pub use codec::MessageCodec;
pub use correlator::{CorrelationKey, PendingResponse, RequestCorrelator};
pub use dib::{DeviceInformation, GatewayInfo, KnxMedium, ServiceFamily, ServiceFamilyType};
pub use error::{KnxError, KnxResult};
pub use message::{
    ChannelRequest, ChannelResponse, ConnectionRequest, ConnectionResponse, HostProtocol, Hpai,
    KnxNetIpMessage, SearchResponse, Status, TunnelingAck, TunnelingLayer, TunnelingRequest,
};
pub use tunnel::{SequenceCounter, TunnelSettings, TunnelState, TunnelStatistics, TunnelingSession};
