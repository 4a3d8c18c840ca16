use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("Invalid group address format, expected main/middle/sub")]
    InvalidGroupFormat,
    #[error("Group address component out of range: {0}")]
    GroupComponentOutOfRange(String),
    #[error("Invalid individual address format, expected area.line.device")]
    InvalidIndividualFormat,
    #[error("Individual address component out of range: {0}")]
    IndividualComponentOutOfRange(String),
}

/// A 3-level KNX group address: main(5 bit)/middle(3 bit)/sub(8 bit).
///
/// Stored as the packed 16-bit bus representation, which is also what
/// equality and hashing use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupAddress(u16);

impl GroupAddress {
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self, AddressError> {
        if main > 31 {
            return Err(AddressError::GroupComponentOutOfRange(format!("main {} > 31", main)));
        }
        if middle > 7 {
            return Err(AddressError::GroupComponentOutOfRange(format!("middle {} > 7", middle)));
        }
        return Ok(GroupAddress((main as u16) << 11 | (middle as u16) << 8 | sub as u16));
    }

    pub fn from_raw(raw: u16) -> Self {
        return GroupAddress(raw);
    }

    pub fn raw(&self) -> u16 {
        return self.0;
    }

    pub fn main(&self) -> u8 {
        return ((self.0 >> 11) & 0x1F) as u8;
    }

    pub fn middle(&self) -> u8 {
        return ((self.0 >> 8) & 0x07) as u8;
    }

    pub fn sub(&self) -> u8 {
        return (self.0 & 0xFF) as u8;
    }
}

impl FromStr for GroupAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(AddressError::InvalidGroupFormat);
        }

        let main: u8 = parts[0].parse().map_err(|_| AddressError::InvalidGroupFormat)?;
        let middle: u8 = parts[1].parse().map_err(|_| AddressError::InvalidGroupFormat)?;
        let sub: u8 = parts[2].parse().map_err(|_| AddressError::InvalidGroupFormat)?;

        return GroupAddress::new(main, middle, sub);
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl TryFrom<String> for GroupAddress {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        return s.parse();
    }
}

impl From<GroupAddress> for String {
    fn from(ga: GroupAddress) -> String {
        return ga.to_string();
    }
}

/// A KNX individual (physical) address: area(4 bit).line(4 bit).device(8 bit).
///
/// Only used to identify telegram sources during discovery, the bridge never
/// sends telegrams carrying one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndividualAddress(u16);

impl IndividualAddress {
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self, AddressError> {
        if area > 15 {
            return Err(AddressError::IndividualComponentOutOfRange(format!("area {} > 15", area)));
        }
        if line > 15 {
            return Err(AddressError::IndividualComponentOutOfRange(format!("line {} > 15", line)));
        }
        return Ok(IndividualAddress((area as u16) << 12 | (line as u16) << 8 | device as u16));
    }

    pub fn from_raw(raw: u16) -> Self {
        return IndividualAddress(raw);
    }

    pub fn raw(&self) -> u16 {
        return self.0;
    }

    pub fn area(&self) -> u8 {
        return ((self.0 >> 12) & 0x0F) as u8;
    }

    pub fn line(&self) -> u8 {
        return ((self.0 >> 8) & 0x0F) as u8;
    }

    pub fn device(&self) -> u8 {
        return (self.0 & 0xFF) as u8;
    }

    /// 0.0.0 is the broadcast/invalid source and never names a real device.
    pub fn is_unspecified(&self) -> bool {
        return self.0 == 0;
    }
}

impl FromStr for IndividualAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(AddressError::InvalidIndividualFormat);
        }

        let area: u8 = parts[0].parse().map_err(|_| AddressError::InvalidIndividualFormat)?;
        let line: u8 = parts[1].parse().map_err(|_| AddressError::InvalidIndividualFormat)?;
        let device: u8 = parts[2].parse().map_err(|_| AddressError::InvalidIndividualFormat)?;

        return IndividualAddress::new(area, line, device);
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl TryFrom<String> for IndividualAddress {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        return s.parse();
    }
}

impl From<IndividualAddress> for String {
    fn from(ia: IndividualAddress) -> String {
        return ia.to_string();
    }
}
