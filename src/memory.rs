use crate::{Result, VmError};
use byte_unit::{Byte, UnitType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A memory or disk size in bytes.
///
/// Parses the lenient human form `<number>[K|M|G][i][B]` (case-insensitive,
/// binary multipliers), e.g. `"3M"`, `"2.5GiB"`, `"512K"`, or a plain byte
/// count like `"1024"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MemorySize(u64);

impl MemorySize {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> u64 {
        self.0
    }

    pub fn as_mebibytes(&self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl FromStr for MemorySize {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        let input = s.trim();

        let split = input
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(input.len());
        let (number, unit) = input.split_at(split);

        if number.is_empty() || !number.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(VmError::InvalidMemorySize(s.to_string()));
        }

        let value: f64 = number
            .parse()
            .map_err(|_| VmError::InvalidMemorySize(s.to_string()))?;

        let multiplier = match unit.to_ascii_lowercase().as_str() {
            "" | "b" => 1.0,
            "k" | "kb" | "ki" | "kib" => KIB,
            "m" | "mb" | "mi" | "mib" => MIB,
            "g" | "gb" | "gi" | "gib" => GIB,
            _ => return Err(VmError::InvalidMemorySize(s.to_string())),
        };

        Ok(Self((value * multiplier).round() as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adjusted = Byte::from_u64(self.0).get_appropriate_unit(UnitType::Binary);
        write!(f, "{adjusted:.1}")
    }
}
