//! Connection trait for KNXnet/IP clients
//!
//! A connection talks to the KNX bus through one gateway. Operations on
//! several tags never fail as a whole: every tag gets its own
//! [`ResponseCode`], so one unreachable device or undecodable value does not
//! hide the results of the others.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use knx_client::connection::{Connection, ConnectionBuilder};
//! use knx_core::PlcValue;
//!
//! # async fn example() -> knx_core::KnxResult<()> {
//! let conn = ConnectionBuilder::new().gateway("192.168.1.10").build()?;
//! conn.connect().await?;
//!
//! let values = conn.read(&[("light", "1/2/3:BOOL")]).await;
//! let codes = conn.write(&[("dimmer", "1/2/4:USINT", PlcValue::Usint(128))]).await;
//!
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::KnxResult;
use crate::subscription::{SubscriptionCallback, SubscriptionHandle, SubscriptionMode};
use knx_core::{DatapointType, PlcValue, ResponseCode};
use std::collections::HashMap;

/// Result of reading one tag
#[derive(Debug, Clone, PartialEq)]
pub struct TagValue {
    pub code: ResponseCode,
    /// Present exactly when `code` is `Ok`
    pub value: Option<PlcValue>,
}

impl TagValue {
    pub fn ok(value: PlcValue) -> Self {
        Self {
            code: ResponseCode::Ok,
            value: Some(value),
        }
    }

    pub fn error(code: ResponseCode) -> Self {
        Self { code, value: None }
    }
}

impl From<KnxResult<PlcValue>> for TagValue {
    fn from(result: KnxResult<PlcValue>) -> Self {
        match result {
            Ok(value) => TagValue::ok(value),
            Err(e) => TagValue::error(e.response_code()),
        }
    }
}

/// Read results by tag name
pub type ReadResponse = HashMap<String, TagValue>;
/// Write results by tag name
pub type WriteResponse = HashMap<String, ResponseCode>;

/// Textual tag of a subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest<'a> {
    pub name: &'a str,
    pub address: &'a str,
    pub datapoint_type: DatapointType,
    pub mode: SubscriptionMode,
}

/// Operations every KNX connection offers
///
/// Tags are passed as `(name, address)` pairs in the textual tag syntax
/// (`1/2/3:BOOL`, `1.1.10#0/56`, `1.1.10#0100:UINT[4]`).
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Locate the gateway and open the tunneling channel
    async fn connect(&self) -> KnxResult<()>;

    /// Close every device session, then the tunneling channel
    async fn disconnect(&self) -> KnxResult<()>;

    /// Probe the gateway with a short deadline
    async fn is_alive(&self) -> bool;

    async fn read(&self, tags: &[(&str, &str)]) -> ReadResponse;

    async fn write(&self, tags: &[(&str, &str, PlcValue)]) -> WriteResponse;

    /// Register `callback` for group values matching the requested tags
    ///
    /// # Errors
    /// Returns error if a tag does not parse or is not a group address tag
    fn subscribe(
        &self,
        tags: &[SubscriptionRequest<'_>],
        callback: SubscriptionCallback,
    ) -> KnxResult<SubscriptionHandle>;

    /// Returns whether `handle` was registered
    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;
}
