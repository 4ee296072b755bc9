//! Common types used throughout the resolver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Represents a virtual address (supports both 32 and 64 bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    pub const ZERO: Address = Address(0);

    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Add a byte offset, returning `None` on overflow
    pub fn checked_add(&self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    /// Distance from `base` to this address, if this address is not below it
    pub fn checked_sub(&self, base: Address) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value as u64)
    }
}

/// Error returned when a user-supplied hex address is rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddressError(pub String);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hex address: {}", self.0)
    }
}

impl std::error::Error for ParseAddressError {}

impl FromStr for Address {
    type Err = ParseAddressError;

    /// Parses `0x1234` or `1234` (hex). At most 16 digits, and zero is rejected
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() || digits.len() > 16 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseAddressError(input.to_string()));
        }

        match u64::from_str_radix(digits, 16) {
            Ok(0) | Err(_) => Err(ParseAddressError(input.to_string())),
            Ok(value) => Ok(Self(value)),
        }
    }
}

/// Architecture type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86,
    X64,
    Arm32,
    Arm64,
    Unknown,
}

impl Architecture {
    pub fn pointer_size(&self) -> usize {
        match self {
            Architecture::X86 | Architecture::Arm32 => 4,
            Architecture::X64 | Architecture::Arm64 => 8,
            Architecture::Unknown => 8,
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, Architecture::X64 | Architecture::Arm64)
    }
}

/// Binary container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryFormat {
    PE,
    ELF,
    MachO,
}

/// A metadata schema version tag such as `24.2` or `29.0`
///
/// Headers only declare the integer part; the minor part comes from an
/// explicit override for builds that need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetadataVersion {
    pub major: u32,
    pub minor: u32,
}

impl MetadataVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for MetadataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for MetadataVersion {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (major, minor) = match input.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (input, "0"),
        };

        let major = major
            .parse::<u32>()
            .map_err(|_| format!("invalid metadata version: {input}"))?;
        let minor = minor
            .parse::<u32>()
            .map_err(|_| format!("invalid metadata version: {input}"))?;

        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for MetadataVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetadataVersion> for String {
    fn from(value: MetadataVersion) -> Self {
        value.to_string()
    }
}

/// Summary of one analysis session, for logs and collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub format: BinaryFormat,
    pub architecture: Architecture,
    pub metadata_version: MetadataVersion,
    pub statistics: ResolutionStatistics,
}

/// Counts gathered while building and resolving the model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStatistics {
    pub total_types: usize,
    pub total_methods: usize,
    pub total_fields: usize,
    pub generic_instantiations: usize,
    pub direct_addresses: usize,
    pub heuristic_addresses: usize,
    pub unresolved_methods: usize,
    pub generic_method_addresses: usize,
    pub issues: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        assert_eq!("0x1500".parse::<Address>(), Ok(Address(0x1500)));
        assert_eq!("1A2b".parse::<Address>(), Ok(Address(0x1a2b)));
        assert!("0x0".parse::<Address>().is_err());
        assert!("0x".parse::<Address>().is_err());
        assert!("12345678123456789".parse::<Address>().is_err());
        assert!("0xZZ".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address(0x1500).to_string(), "0x1500");
    }

    #[test]
    fn test_metadata_version_parse_and_order() {
        let v: MetadataVersion = "24.2".parse().unwrap();
        assert_eq!(v, MetadataVersion::new(24, 2));
        assert_eq!("29".parse::<MetadataVersion>().unwrap(), MetadataVersion::new(29, 0));
        assert!("24.x".parse::<MetadataVersion>().is_err());
        assert!(MetadataVersion::new(24, 5) < MetadataVersion::new(27, 0));
        assert_eq!(v.to_string(), "24.2");
    }
}
