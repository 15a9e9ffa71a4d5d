//! Decimal byte units used for report display and byte-count arguments.
//!
//! Units only scale what is shown; counters always hold raw bytes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Display unit for transferred amounts (1000-based).
///
/// # Examples
///
/// ```
/// use simpleperf::units::Unit;
///
/// assert_eq!(Unit::Kilobytes.scale(2500), 2.5);
/// assert_eq!(Unit::Megabytes.suffix(), "MB");
/// assert_eq!("kb".parse::<Unit>().unwrap(), Unit::Kilobytes);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Unit {
    /// Plain bytes
    #[serde(rename = "B")]
    Bytes,
    /// 1 KB = 1,000 bytes
    #[serde(rename = "KB")]
    Kilobytes,
    /// 1 MB = 1,000,000 bytes
    #[default]
    #[serde(rename = "MB")]
    Megabytes,
}

impl Unit {
    /// Number of bytes in one of this unit.
    pub fn multiplier(self) -> u64 {
        match self {
            Unit::Bytes => 1,
            Unit::Kilobytes => 1_000,
            Unit::Megabytes => 1_000_000,
        }
    }

    /// Converts a raw byte count into this unit.
    pub fn scale(self, bytes: u64) -> f64 {
        bytes as f64 / self.multiplier() as f64
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Unit::Bytes => "B",
            Unit::Kilobytes => "KB",
            Unit::Megabytes => "MB",
        }
    }

    /// Formats a byte count as `<amount with two decimals><suffix>`.
    pub fn format_amount(self, bytes: u64) -> String {
        format!("{:.2}{}", self.scale(bytes), self.suffix())
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "B" => Ok(Unit::Bytes),
            "KB" => Ok(Unit::Kilobytes),
            "MB" => Ok(Unit::Megabytes),
            other => Err(Error::Config(format!(
                "unknown unit '{}', expected B, KB or MB",
                other
            ))),
        }
    }
}

/// Parses a byte count with a mandatory unit suffix, e.g. `5000B`, `10KB`, `1MB`.
///
/// The numeric part must be a positive integer.
///
/// # Examples
///
/// ```
/// use simpleperf::units::parse_byte_count;
///
/// assert_eq!(parse_byte_count("5000B").unwrap(), 5000);
/// assert_eq!(parse_byte_count("10KB").unwrap(), 10_000);
/// assert_eq!(parse_byte_count("1MB").unwrap(), 1_000_000);
/// assert!(parse_byte_count("12").is_err());
/// ```
pub fn parse_byte_count(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::Config(format!("'{}' is missing a unit (B, KB or MB)", input)))?;

    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(Error::Config(format!("'{}' does not start with a number", input)));
    }

    let count: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("'{}' is not a valid byte count", input)))?;
    if count == 0 {
        return Err(Error::Config("byte count must be positive".to_string()));
    }

    let unit: Unit = suffix.parse()?;
    count
        .checked_mul(unit.multiplier())
        .ok_or_else(|| Error::Config(format!("'{}' overflows a 64-bit byte count", input)))
}
