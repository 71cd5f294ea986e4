//! Core value types used throughout tether.
//!
//! Values that arrive as human-readable text in configuration files are
//! parsed into these types once, at load time.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// A byte count parsed from a human-readable size such as `"1G"`.
///
/// Units are 1024-based and case-insensitive; an optional trailing `B` is
/// accepted (`"512M"`, `"512MB"`, `"1024k"`). A bare integer is a byte count.
///
/// # Example
/// ```
/// use tether_common::ByteSize;
///
/// let size: ByteSize = "1G".parse().unwrap();
/// assert_eq!(size.as_bytes(), 1024 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(u64);

/// Error returned when a size string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ByteSizeParseError {
    #[error("size is empty")]
    Empty,

    #[error("invalid size number in {0:?}")]
    InvalidNumber(String),

    #[error("unknown size unit {unit:?} in {input:?} (expected K, M, G or T)")]
    UnknownUnit { input: String, unit: String },

    #[error("size {0:?} does not fit in 64 bits")]
    Overflow(String),
}

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * KIB)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * GIB)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for ByteSize {
    type Err = ByteSizeParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ByteSizeParseError::Empty);
        }

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let unit = unit.trim().to_ascii_uppercase();

        let multiplier = match unit.as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            _ => {
                return Err(ByteSizeParseError::UnknownUnit {
                    input: input.to_string(),
                    unit,
                })
            }
        };

        if number.is_empty() {
            return Err(ByteSizeParseError::InvalidNumber(input.to_string()));
        }

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .map(ByteSize)
                .ok_or_else(|| ByteSizeParseError::Overflow(input.to_string()));
        }

        // Fractional sizes such as "1.5G" are rounded down to whole bytes.
        let fractional: f64 = number
            .parse()
            .map_err(|_| ByteSizeParseError::InvalidNumber(input.to_string()))?;
        let bytes = fractional * multiplier as f64;
        if !bytes.is_finite() || bytes >= u64::MAX as f64 {
            return Err(ByteSizeParseError::Overflow(input.to_string()));
        }
        Ok(ByteSize(bytes as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, scale) in [("T", TIB), ("G", GIB), ("M", MIB), ("K", KIB)] {
            if self.0 >= scale {
                return if self.0 % scale == 0 {
                    write!(f, "{}{}", self.0 / scale, unit)
                } else {
                    write!(f, "{:.1}{}", self.0 as f64 / scale as f64, unit)
                };
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl<'de> Visitor<'de> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string such as \"1G\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom(format!("size cannot be negative: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}
