//! Client connection to a KNXnet/IP gateway

pub mod builder;
pub mod connection;
pub mod knx_connection;
mod read;
mod write;

pub use builder::{ConnectionBuilder, parse_gateway};
pub use connection::{Connection, ReadResponse, SubscriptionRequest, TagValue, WriteResponse};
pub use knx_connection::KnxConnection;
