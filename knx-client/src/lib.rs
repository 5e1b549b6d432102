//! KNXnet/IP client
//!
//! This crate builds the user facing connection on top of the tunneling
//! session: group value reads and writes with a value cache, subscriptions,
//! connection-oriented device access (properties, memory, authorization) and
//! gateway discovery.

pub mod cache;
pub mod config;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod error;
pub mod payload;
pub mod subscription;

mod router;

#[cfg(test)]
mod test_support;

pub use cache::GroupValueCache;
pub use config::ConnectionConfig;
pub use connection::{
    Connection, ConnectionBuilder, KnxConnection, ReadResponse, SubscriptionRequest, TagValue, WriteResponse,
};
pub use device::{DeviceFamily, DeviceRegistry, DeviceSession, PropertyValue};
pub use discovery::{DiscoveredGateway, DiscoveryOptions, discover};
pub use error::{KnxError, KnxResult};
pub use subscription::{
    SubscribedValue, SubscriptionCallback, SubscriptionEvent, SubscriptionHandle, SubscriptionMode, SubscriptionTag,
};
