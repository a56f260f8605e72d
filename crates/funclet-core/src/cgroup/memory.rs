//! Memory resource control via cgroup v1.
//!
//! Manages `memory.limit_in_bytes` and reads `memory.usage_in_bytes`.

use std::path::Path;

use funclet_common::constants::MEMORY_NO_LIMIT;
use funclet_common::error::{FuncletError, Result};

const UNITS: [(&str, i64); 5] = [
    ("k", 1 << 10),
    ("m", 1 << 20),
    ("g", 1 << 30),
    ("t", 1 << 40),
    ("p", 1 << 50),
];

/// Parses human-readable memory strings like `512M`, `1.5g`, `256MiB` or
/// `1048576` into bytes.
///
/// Every suffix is binary (`1M == 1 MiB`), case-insensitive, and may carry a
/// trailing `b` or `ib`.
///
/// # Errors
///
/// Returns `FuncletError::Config` if the string is empty, negative, or has an
/// unknown suffix.
pub fn parse_memory(input: &str) -> Result<i64> {
    let invalid = || FuncletError::Config {
        message: format!("invalid memory size: {input:?}"),
    };
    let lower = input.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, suffix) = lower.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }
    let suffix = suffix.trim();
    let suffix = suffix
        .strip_suffix("ib")
        .or_else(|| suffix.strip_suffix('b'))
        .unwrap_or(suffix);
    let multiplier = if suffix.is_empty() {
        1
    } else {
        UNITS
            .iter()
            .find(|(unit, _)| *unit == suffix)
            .map(|(_, m)| *m)
            .ok_or_else(invalid)?
    };
    if number.contains('.') {
        let value: f64 = number.parse().map_err(|_| invalid())?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        let bytes = (value * multiplier as f64) as i64;
        Ok(bytes)
    } else {
        let value: i64 = number.parse().map_err(|_| invalid())?;
        value.checked_mul(multiplier).ok_or_else(invalid)
    }
}

/// Returns `true` if a limit read from the kernel means "unlimited".
#[must_use]
pub const fn is_unlimited(limit: i64) -> bool {
    limit >= MEMORY_NO_LIMIT
}

/// Reads `memory.limit_in_bytes`.
///
/// # Errors
///
/// Returns an error if the control file cannot be read.
pub fn read_limit(cgroup_path: &Path) -> Result<i64> {
    super::read_i64(&cgroup_path.join("memory.limit_in_bytes"))
}

/// Reads `memory.usage_in_bytes`.
///
/// # Errors
///
/// Returns an error if the control file cannot be read.
pub fn read_usage(cgroup_path: &Path) -> Result<i64> {
    super::read_i64(&cgroup_path.join("memory.usage_in_bytes"))
}

/// Sets the hard memory limit for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `memory.limit_in_bytes` fails, which the
/// kernel also reports when the limit is below current usage.
pub fn set_limit(cgroup_path: &Path, bytes: i64) -> Result<()> {
    super::write_value(&cgroup_path.join("memory.limit_in_bytes"), bytes)?;
    tracing::debug!(bytes, "memory limit set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_letter_suffixes() {
        assert_eq!(parse_memory("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("64k").unwrap(), 64 * 1024);
    }

    #[test]
    fn parse_long_suffixes() {
        assert_eq!(parse_memory("128MiB").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_memory("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory(" 10 kb ").unwrap(), 10 * 1024);
    }

    #[test]
    fn parse_plain_and_fractional() {
        assert_eq!(parse_memory("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_memory("1.5G").unwrap(), 1536 * 1024 * 1024);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("abc").is_err());
        assert!(parse_memory("12X").is_err());
        assert!(parse_memory("-5M").is_err());
    }

    #[test]
    fn unlimited_marker() {
        assert!(is_unlimited(MEMORY_NO_LIMIT));
        assert!(is_unlimited(i64::MAX));
        assert!(!is_unlimited(1 << 30));
    }

    #[test]
    fn limit_and_usage_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.usage_in_bytes"), "4096\n").unwrap();
        set_limit(dir.path(), 8192).unwrap();
        assert_eq!(read_limit(dir.path()).unwrap(), 8192);
        assert_eq!(read_usage(dir.path()).unwrap(), 4096);
    }
}
