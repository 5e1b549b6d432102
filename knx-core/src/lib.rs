//! Core types and utilities for the KNXnet/IP protocol
//!
//! This crate provides the error type, bus addresses, datapoint values and
//! tag model shared by every layer of the driver.

pub mod address;
pub mod datapoint;
pub mod error;
pub mod response;
pub mod tag;

pub use address::{GroupAddress, GroupAddressLevels, IndividualAddress};
pub use datapoint::{DatapointCodec, DatapointType, PlcValue, StandardDatapointCodec};
pub use error::{KnxError, KnxResult};
pub use response::ResponseCode;
pub use tag::{
    DeviceMemoryTag, DevicePropertyTag, GroupAddressPattern, GroupAddressTag, KnxTag,
    MAX_PROPERTY_ELEMENTS, MAX_PROPERTY_INDEX, PatternSegment, check_property_range,
};
