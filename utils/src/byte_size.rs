use std::fmt::{self, Display};

use anyhow::{anyhow, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;
pub const PIB: u64 = 1024 * TIB;

/// Parse a human readable size such as `512M`, `20G`, `1.5GiB` or `1024`
/// into bytes. Units are always binary (1G == 1024^3) and case
/// insensitive; a missing unit means bytes.
pub fn parse_byte_size(size: &str) -> Result<u64> {
    let trimmed = size.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(anyhow!("invalid size: '{}'", size));
    }

    let unit = unit.strip_prefix(' ').unwrap_or(unit).to_ascii_lowercase();
    let unit = unit.strip_suffix('b').unwrap_or(&unit);
    let unit = unit.strip_suffix('i').unwrap_or(unit);
    let multiplier = match unit {
        "" => 1,
        "k" => KIB,
        "m" => MIB,
        "g" => GIB,
        "t" => TIB,
        "p" => PIB,
        _ => return Err(anyhow!("invalid size: '{}'", size)),
    };

    // Integers are kept exact, fractional values go through f64.
    if let Ok(value) = number.parse::<u64>() {
        return value
            .checked_mul(multiplier)
            .ok_or_else(|| anyhow!("size overflows: '{}'", size));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| anyhow!("invalid size: '{}'", size))?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(anyhow!("size overflows: '{}'", size));
    }
    Ok(bytes as u64)
}

/// Byte count that renders with the largest whole binary unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [(PIB, "PiB"), (TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];
        for (unit, suffix) in units {
            if self.0 >= unit && self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "{}B", self.0)
    }
}
