//! KNXnet/IP tunneling driver
//!
//! # Architecture
//!
//! - `knx-core`: errors, bus addresses, datapoint values and tags
//! - `knx-transport`: byte-stream transport over UDP
//! - `knx-application`: cEMI frames and application PDUs
//! - `knx-session`: KNXnet/IP messages, request correlation and the
//!   tunneling session
//! - `knx-client`: connections, device sessions, group value cache,
//!   subscriptions and discovery
//!
//! # Usage
//!
//! ```no_run
//! use knx::client::{Connection, ConnectionBuilder};
//!
//! # async fn example() -> knx::KnxResult<()> {
//! let conn = ConnectionBuilder::new().gateway("udp://192.168.1.10").build()?;
//! conn.connect().await?;
//! let values = conn.read(&[("temperature", "1/1/10:DPT9.001")]).await;
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub use knx_core::{
    DatapointType, GroupAddress, GroupAddressLevels, IndividualAddress, KnxError, KnxResult, KnxTag, PlcValue,
    ResponseCode,
};

pub mod client {
    pub use knx_client::*;
}

pub mod session {
    pub use knx_session::*;
}

pub mod frame {
    pub use knx_application::*;
}

pub mod transport {
    pub use knx_transport::*;
}
