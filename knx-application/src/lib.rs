//! Application layer for KNX
//!
//! This crate models the frames carried inside a tunneling request: the cEMI
//! link layer frame and the transport/application PDU inside it.

pub mod apdu;
pub mod cemi;

pub use apdu::{Apdu, ApduBody, ControlType, DataApdu, PropertyDescription};
pub use cemi::{Cemi, Destination, LDataFrame, MessageCode, Priority};
