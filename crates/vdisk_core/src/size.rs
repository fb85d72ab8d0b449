//! Size-specification grammar for new partitions
//!
//! `"<1-100>%"` is a share of the usable space; `"<n><unit>"` with a unit of
//! `K`, `M`, `G`, `T` or `P` (powers of 1024) or a bare `"<n>"` is an
//! absolute byte count.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{DiskError, DiskResult};

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,3})\s*%\s*$").expect("valid percent regex"));
static ABSOLUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*([KkMmGgTtPp]?)\s*$").expect("valid size regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Percent(u8),
    Bytes(u64),
}

impl SizeSpec {
    pub fn parse(spec: &str) -> DiskResult<Self> {
        let invalid = || DiskError::InvalidSizeSpec(spec.to_string());

        if let Some(caps) = PERCENT_RE.captures(spec) {
            let pct: u8 = caps[1].parse().map_err(|_| invalid())?;
            if pct == 0 || pct > 100 {
                return Err(invalid());
            }
            return Ok(SizeSpec::Percent(pct));
        }

        let caps = ABSOLUTE_RE.captures(spec).ok_or_else(invalid)?;
        let value: u64 = caps[1].parse().map_err(|_| invalid())?;
        let shift = match caps[2].to_ascii_uppercase().as_str() {
            "" => 0,
            "K" => 10,
            "M" => 20,
            "G" => 30,
            "T" => 40,
            "P" => 50,
            _ => return Err(invalid()),
        };
        let bytes = value.checked_mul(1u64 << shift).ok_or_else(invalid)?;
        if bytes == 0 {
            return Err(invalid());
        }
        Ok(SizeSpec::Bytes(bytes))
    }

    /// Byte count this spec asks for on an image of `virtual_size` bytes
    /// whose first `reserved_bytes` are off limits.
    ///
    /// Percentages are taken of the space left after the reserved head and a
    /// two-block margin, rounded down to whole blocks. Absolute sizes must be
    /// strictly below the space after the head.
    pub fn resolve(&self, virtual_size: u64, reserved_bytes: u64, block_size: u64) -> DiskResult<u64> {
        let block_size = block_size.max(1);
        let available = virtual_size.saturating_sub(reserved_bytes);
        match *self {
            SizeSpec::Percent(pct) => {
                let usable = available.saturating_sub(2 * block_size);
                let share = u128::from(usable) * u128::from(pct) / 100;
                let bytes = (share / u128::from(block_size)) as u64 * block_size;
                if bytes == 0 {
                    return Err(DiskError::SizeExceedsExtents {
                        requested: block_size,
                        available: usable,
                    });
                }
                Ok(bytes)
            }
            SizeSpec::Bytes(bytes) => {
                if bytes >= available {
                    return Err(DiskError::SizeExceedsExtents {
                        requested: bytes,
                        available,
                    });
                }
                Ok(bytes)
            }
        }
    }
}

impl FromStr for SizeSpec {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SizeSpec::parse(s)
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSpec::Percent(pct) => write!(f, "{pct}%"),
            SizeSpec::Bytes(bytes) => write!(f, "{bytes}"),
        }
    }
}
