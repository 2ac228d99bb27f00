//! Human-readable byte sizes for CLI and log output.

use std::fmt;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Byte count rendered with IEC units and at most two significant decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scaled, unit) = UNITS[1..]
            .iter()
            .fold((self.0 as f64, UNITS[0]), |(value, unit), next| {
                if value >= 1024.0 {
                    (value / 1024.0, *next)
                } else {
                    (value, unit)
                }
            });

        if unit == UNITS[0] {
            return write!(f, "{} {unit}", self.0);
        }

        let precision = if scaled >= 10.0 { 1 } else { 2 };
        let rendered = format!("{scaled:.precision$}");
        let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
        write!(f, "{trimmed} {unit}")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    ByteSize(bytes).to_string()
}
