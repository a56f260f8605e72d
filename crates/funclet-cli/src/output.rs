//! Formatted output helpers for CLI commands.

const UNITS: [(&str, i64); 4] = [("Ti", 1 << 40), ("Gi", 1 << 30), ("Mi", 1 << 20), ("Ki", 1 << 10)];

/// Formats a byte count with the largest binary unit that divides it
/// exactly (`128Mi`), falling back to one decimal place (`1.5Gi`).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_memory(bytes: i64) -> String {
    if bytes <= 0 {
        return bytes.to_string();
    }
    if let Some((unit, size)) = UNITS.iter().find(|(_, size)| bytes % size == 0) {
        return format!("{}{unit}", bytes / size);
    }
    match UNITS.iter().find(|(_, size)| bytes >= *size) {
        Some((unit, size)) => format!("{:.1}{unit}", bytes as f64 / *size as f64),
        None => bytes.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_multiples_use_integer_units() {
        assert_eq!(format_memory(128 << 20), "128Mi");
        assert_eq!(format_memory(8 << 30), "8Gi");
        assert_eq!(format_memory(3 << 10), "3Ki");
    }

    #[test]
    fn inexact_values_round_to_one_decimal() {
        assert_eq!(format_memory((3 << 30) / 2 + 1), "1.5Gi");
        assert_eq!(format_memory(512), "512");
    }

    #[test]
    fn zero_and_negative_are_raw() {
        assert_eq!(format_memory(0), "0");
        assert_eq!(format_memory(-1), "-1");
    }
}
