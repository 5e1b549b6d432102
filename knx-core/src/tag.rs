//! Tag model and textual tag parser
//!
//! Three tag kinds exist:
//!
//! - group address tags, `1/2/3:BOOL`, whose address segments may also be
//!   patterns (`*`, `[1,4,7]`, `[10-20]`), with an optional element count
//!   `1/2/3:USINT[4]`
//! - device property tags, `1.1.10#0/56/1[1]:UINT` (object index, property
//!   id, optional start index and element count)
//! - device memory tags, `1.1.10#0100:UINT[10]` (hex memory address)

use crate::address::{GroupAddress, GroupAddressLevels, IndividualAddress};
use crate::datapoint::DatapointType;
use crate::error::{KnxError, KnxResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static GROUP_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<address>[0-9*\[\],\- /]+?)(?::(?P<datatype>[A-Za-z0-9_.]+)(?:\[(?P<quantity>\d+)\])?)?$")
        .expect("group tag pattern is valid")
});

static PROPERTY_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<device>\d+\.\d+\.\d+)#(?P<object>\d+)/(?P<property>\d+)(?:/(?P<index>\d+))?(?:\[(?P<count>\d+)\])?(?::(?P<datatype>[A-Za-z0-9_.]+))?$")
        .expect("property tag pattern is valid")
});

static MEMORY_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<device>\d+\.\d+\.\d+)#(?P<address>[0-9A-Fa-f]{1,4})(?::(?P<datatype>[A-Za-z0-9_.]+)(?:\[(?P<count>\d+)\])?)?$")
        .expect("memory tag pattern is valid")
});

/// Largest element count a property access can carry (4 bits on the wire)
pub const MAX_PROPERTY_ELEMENTS: u8 = 0x0F;
/// Largest property start index (12 bits on the wire)
pub const MAX_PROPERTY_INDEX: u16 = 0x0FFF;

/// One level of a group address pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    Exact(u16),
    Wildcard,
    List(Vec<u16>),
    /// Inclusive range
    Range(u16, u16),
}

impl PatternSegment {
    pub fn parse(s: &str) -> KnxResult<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(PatternSegment::Wildcard);
        }
        if let Some(inner) = s.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            if inner.contains(',') {
                let values = inner
                    .split(',')
                    .map(parse_component)
                    .collect::<KnxResult<Vec<u16>>>()?;
                return Ok(PatternSegment::List(values));
            }
            if let Some((from, to)) = inner.split_once('-') {
                let from = parse_component(from)?;
                let to = parse_component(to)?;
                if from > to {
                    return Err(KnxError::InvalidAddress(format!("Empty range [{}]", inner)));
                }
                return Ok(PatternSegment::Range(from, to));
            }
            return Ok(PatternSegment::List(vec![parse_component(inner)?]));
        }
        Ok(PatternSegment::Exact(parse_component(s)?))
    }

    pub fn matches(&self, value: u16) -> bool {
        match self {
            PatternSegment::Exact(v) => *v == value,
            PatternSegment::Wildcard => true,
            PatternSegment::List(values) => values.contains(&value),
            PatternSegment::Range(from, to) => (*from..=*to).contains(&value),
        }
    }
}

impl fmt::Display for PatternSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternSegment::Exact(v) => write!(f, "{}", v),
            PatternSegment::Wildcard => f.write_str("*"),
            PatternSegment::List(values) => {
                let joined: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", joined.join(","))
            }
            PatternSegment::Range(from, to) => write!(f, "[{}-{}]", from, to),
        }
    }
}

fn parse_component(s: &str) -> KnxResult<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| KnxError::InvalidAddress(format!("Invalid address component: {}", s)))
}

/// Group address pattern with one segment per hierarchy level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAddressPattern {
    levels: GroupAddressLevels,
    segments: Vec<PatternSegment>,
}

impl GroupAddressPattern {
    pub fn parse(s: &str, levels: GroupAddressLevels) -> KnxResult<Self> {
        let segments = s
            .split('/')
            .map(PatternSegment::parse)
            .collect::<KnxResult<Vec<_>>>()?;
        if segments.len() != levels.count() as usize {
            return Err(KnxError::InvalidAddress(format!(
                "{} has {} levels, connection uses {}",
                s,
                segments.len(),
                levels.count()
            )));
        }
        Ok(Self { levels, segments })
    }

    /// Pattern matching exactly one address
    pub fn exact(address: GroupAddress, levels: GroupAddressLevels) -> Self {
        let segments = address
            .components(levels)
            .into_iter()
            .map(PatternSegment::Exact)
            .collect();
        Self { levels, segments }
    }

    pub fn levels(&self) -> GroupAddressLevels {
        self.levels
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// Every segment must match its component
    pub fn matches(&self, address: GroupAddress) -> bool {
        address
            .components(self.levels)
            .iter()
            .zip(&self.segments)
            .all(|(component, segment)| segment.matches(*component))
    }

    /// The address this pattern denotes if every segment is exact
    pub fn single_address(&self) -> Option<GroupAddress> {
        let components = self
            .segments
            .iter()
            .map(|segment| match segment {
                PatternSegment::Exact(v) => Some(*v),
                _ => None,
            })
            .collect::<Option<Vec<u16>>>()?;
        GroupAddress::from_components(&components, self.levels).ok()
    }
}

impl fmt::Display for GroupAddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupAddressTag {
    pub pattern: GroupAddressPattern,
    pub datapoint_type: Option<DatapointType>,
    pub quantity: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DevicePropertyTag {
    pub device: IndividualAddress,
    pub object_index: u8,
    pub property_id: u8,
    pub property_index: u16,
    pub num_elements: u8,
    pub datapoint_type: Option<DatapointType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMemoryTag {
    pub device: IndividualAddress,
    pub address: u16,
    pub num_elements: u8,
    pub datapoint_type: Option<DatapointType>,
}

/// A parsed tag address
#[derive(Debug, Clone, PartialEq)]
pub enum KnxTag {
    GroupAddress(GroupAddressTag),
    DeviceProperty(DevicePropertyTag),
    DeviceMemory(DeviceMemoryTag),
}

impl KnxTag {
    /// Parse a textual tag, interpreting group addresses with `levels`
    pub fn parse(s: &str, levels: GroupAddressLevels) -> KnxResult<Self> {
        let s = s.trim();
        if let Some(caps) = PROPERTY_TAG.captures(s) {
            let property_index = caps
                .name("index")
                .map(|m| parse_number(m.as_str()))
                .transpose()?
                .unwrap_or(1);
            let num_elements = caps
                .name("count")
                .map(|m| parse_number(m.as_str()))
                .transpose()?
                .unwrap_or(1);
            check_property_range(property_index, num_elements)?;
            return Ok(KnxTag::DeviceProperty(DevicePropertyTag {
                device: caps["device"].parse()?,
                object_index: parse_number(&caps["object"])?,
                property_id: parse_number(&caps["property"])?,
                property_index,
                num_elements,
                datapoint_type: parse_datatype(caps.name("datatype").map(|m| m.as_str()))?,
            }));
        }
        if let Some(caps) = MEMORY_TAG.captures(s) {
            let address = u16::from_str_radix(&caps["address"], 16)
                .map_err(|_| KnxError::InvalidAddress(format!("Invalid memory address in {}", s)))?;
            return Ok(KnxTag::DeviceMemory(DeviceMemoryTag {
                device: caps["device"].parse()?,
                address,
                num_elements: caps
                    .name("count")
                    .map(|m| parse_number(m.as_str()))
                    .transpose()?
                    .unwrap_or(1),
                datapoint_type: parse_datatype(caps.name("datatype").map(|m| m.as_str()))?,
            }));
        }
        if let Some(caps) = GROUP_TAG.captures(s) {
            return Ok(KnxTag::GroupAddress(GroupAddressTag {
                pattern: GroupAddressPattern::parse(&caps["address"], levels)?,
                datapoint_type: parse_datatype(caps.name("datatype").map(|m| m.as_str()))?,
                quantity: caps
                    .name("quantity")
                    .map(|m| parse_number(m.as_str()))
                    .transpose()?
                    .unwrap_or(1),
            }));
        }
        Err(KnxError::InvalidAddress(format!("Unrecognized tag address: {}", s)))
    }

    pub fn datapoint_type(&self) -> Option<DatapointType> {
        match self {
            KnxTag::GroupAddress(tag) => tag.datapoint_type,
            KnxTag::DeviceProperty(tag) => tag.datapoint_type,
            KnxTag::DeviceMemory(tag) => tag.datapoint_type,
        }
    }
}

/// Start index and element count must fit the packed property header
pub fn check_property_range(index: u16, count: u8) -> KnxResult<()> {
    if count > MAX_PROPERTY_ELEMENTS {
        return Err(KnxError::InvalidAddress(format!(
            "Property element count {} exceeds {}",
            count, MAX_PROPERTY_ELEMENTS
        )));
    }
    if index > MAX_PROPERTY_INDEX {
        return Err(KnxError::InvalidAddress(format!(
            "Property start index {} exceeds {}",
            index, MAX_PROPERTY_INDEX
        )));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(s: &str) -> KnxResult<T> {
    s.parse::<T>()
        .map_err(|_| KnxError::InvalidAddress(format!("Number out of range: {}", s)))
}

fn parse_datatype(s: Option<&str>) -> KnxResult<Option<DatapointType>> {
    s.map(|name| name.parse::<DatapointType>()).transpose()
}
