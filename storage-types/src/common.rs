// SPDX-License-Identifier: GPL-3.0-only

//! Byte and percentage formatting shared by status reports

use num_format::{Locale, ToFormattedString};

const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = bytes as f64;

    while val >= 1024. && steps < UNITS.len() - 1 {
        val /= 1024.;
        steps += 1;
    }

    if add_bytes {
        format!(
            "{:.2} {} ({} bytes)",
            val,
            UNITS[steps],
            bytes.to_formatted_string(&Locale::en)
        )
    } else {
        format!("{:.2} {}", val, UNITS[steps])
    }
}

/// Parse a human-readable size back into bytes.
///
/// Accepts both the spaced form produced by [`bytes_to_pretty`] ("1.50 GB")
/// and the suffixed form printed by btrfs-progs ("8.00MiB", "0.00B").
/// Units are powers of 1024 either way.
pub fn pretty_to_bytes(pretty: &str) -> Option<u64> {
    let pretty = pretty.trim();
    let split = pretty
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(pretty.len());
    let (number, unit) = pretty.split_at(split);

    let mut val: f64 = number.parse().ok()?;
    let unit = unit.trim().replace("iB", "B");
    let unit = if unit.is_empty() { "B" } else { unit.as_str() };
    let steps = UNITS.iter().position(|candidate| *candidate == unit)?;

    for _ in 0..steps {
        val *= 1024.;
    }

    Some(val.round() as u64)
}

/// Share of `part` in `total` as a percentage string ("12.50%").
pub fn percent(part: u64, total: u64) -> String {
    if total == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", part as f64 * 100. / total as f64)
}

/// Group digits of a block count for display ("1,234,567").
pub fn grouped(count: u64) -> String {
    count.to_formatted_string(&Locale::en)
}
