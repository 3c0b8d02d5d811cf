/*!
 * Core data types for MeshFlow.
 *
 * This module defines the fundamental data types used throughout the MeshFlow ecosystem.
 */
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A 64-bit IEEE address, the primary key for protocol-level device state
///
/// The device uuid used by the rest of the system is the address rendered as
/// 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64(u64);

impl Eui64 {
    /// Create an address from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw address value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Render the address as a device uuid
    pub fn to_uuid(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse a device uuid back into an address
    pub fn from_uuid<S: AsRef<str>>(uuid: S) -> Result<Self, Error> {
        uuid.as_ref().parse()
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Eui64 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() || digits.len() > 16 {
            return Err(Error::parse(format!("Invalid EUI64: {}", s)));
        }

        u64::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|e| Error::parse(format!("Invalid EUI64 {}: {}", s, e)))
    }
}

impl From<u64> for Eui64 {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_uuid())
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A string key-value bag of metadata
pub type Metadata = HashMap<String, String>;

/// A reference-counted metadata
pub type SharedMetadata = Arc<Metadata>;
