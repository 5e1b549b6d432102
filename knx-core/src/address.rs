//! KNX individual and group addresses

use crate::error::{KnxError, KnxResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical address of one bus device (area.line.device, 4/4/8 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// The null address `0.0.0`, used as source for device management frames
    pub const NULL: IndividualAddress = IndividualAddress { raw: 0 };

    /// Create an individual address from its three components
    ///
    /// # Arguments
    ///
    /// * `area` - Area (0-15)
    /// * `line` - Line (0-15)
    /// * `device` - Device (0-255)
    pub fn new(area: u8, line: u8, device: u8) -> KnxResult<Self> {
        if area > 0x0F || line > 0x0F {
            return Err(KnxError::InvalidAddress(format!(
                "{}.{}.{}: area and line must be below 16",
                area, line, device
            )));
        }
        Ok(Self {
            raw: ((area as u16) << 12) | ((line as u16) << 8) | device as u16,
        })
    }

    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    pub fn area(&self) -> u8 {
        (self.raw >> 12) as u8
    }

    pub fn line(&self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    pub fn device(&self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        self.raw.to_be_bytes()
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> KnxResult<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(KnxError::InvalidAddress(format!(
                "Expected area.line.device, got {}",
                s
            )));
        }
        let mut values = [0u8; 3];
        for (i, part) in parts.iter().enumerate() {
            values[i] = part
                .parse::<u8>()
                .map_err(|_| KnxError::InvalidAddress(format!("Invalid address component: {}", part)))?;
        }
        Self::new(values[0], values[1], values[2])
    }
}

/// Number of hierarchy levels used to interpret group addresses
///
/// Group addresses are not self-describing, every component that prints or
/// matches them must be told which interpretation is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum GroupAddressLevels {
    /// Free 16-bit address
    One,
    /// main/sub, 5/11 bits
    Two,
    /// main/middle/sub, 5/3/8 bits
    #[default]
    Three,
}

impl GroupAddressLevels {
    pub fn count(&self) -> u8 {
        match self {
            GroupAddressLevels::One => 1,
            GroupAddressLevels::Two => 2,
            GroupAddressLevels::Three => 3,
        }
    }

    /// Upper bound (inclusive) of each level's component
    pub fn component_limits(&self) -> &'static [u16] {
        match self {
            GroupAddressLevels::One => &[0xFFFF],
            GroupAddressLevels::Two => &[0x1F, 0x07FF],
            GroupAddressLevels::Three => &[0x1F, 0x07, 0xFF],
        }
    }
}

impl TryFrom<u8> for GroupAddressLevels {
    type Error = KnxError;

    fn try_from(value: u8) -> KnxResult<Self> {
        match value {
            1 => Ok(GroupAddressLevels::One),
            2 => Ok(GroupAddressLevels::Two),
            3 => Ok(GroupAddressLevels::Three),
            other => Err(KnxError::InvalidData(format!(
                "Group address level count must be 1, 2 or 3, got {}",
                other
            ))),
        }
    }
}

impl From<GroupAddressLevels> for u8 {
    fn from(levels: GroupAddressLevels) -> u8 {
        levels.count()
    }
}

/// Logical group address, stored as its raw 16-bit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        self.raw.to_be_bytes()
    }

    /// Build a group address from its components under the given level count
    pub fn from_components(components: &[u16], levels: GroupAddressLevels) -> KnxResult<Self> {
        let limits = levels.component_limits();
        if components.len() != limits.len() {
            return Err(KnxError::InvalidAddress(format!(
                "{}-level group address needs {} components, got {}",
                levels.count(),
                limits.len(),
                components.len()
            )));
        }
        for (value, limit) in components.iter().zip(limits) {
            if value > limit {
                return Err(KnxError::InvalidAddress(format!(
                    "Group address component {} exceeds {}",
                    value, limit
                )));
            }
        }
        let raw = match levels {
            GroupAddressLevels::One => components[0],
            GroupAddressLevels::Two => (components[0] << 11) | components[1],
            GroupAddressLevels::Three => (components[0] << 11) | (components[1] << 8) | components[2],
        };
        Ok(Self { raw })
    }

    /// Split the raw value into its components under the given level count
    pub fn components(&self, levels: GroupAddressLevels) -> Vec<u16> {
        match levels {
            GroupAddressLevels::One => vec![self.raw],
            GroupAddressLevels::Two => vec![self.raw >> 11, self.raw & 0x07FF],
            GroupAddressLevels::Three => {
                vec![self.raw >> 11, (self.raw >> 8) & 0x07, self.raw & 0xFF]
            }
        }
    }

    /// Format as `a/b/c`, `a/b` or `a` depending on the level count
    pub fn format(&self, levels: GroupAddressLevels) -> String {
        self.components(levels)
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn parse(s: &str, levels: GroupAddressLevels) -> KnxResult<Self> {
        let components = s
            .trim()
            .split('/')
            .map(|part| {
                part.parse::<u16>()
                    .map_err(|_| KnxError::InvalidAddress(format!("Invalid group address component: {}", part)))
            })
            .collect::<KnxResult<Vec<u16>>>()?;
        Self::from_components(&components, levels)
    }
}
