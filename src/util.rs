//! Human-readable formatting for byte counts, transfer rates and ETAs.

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
const SPEED_UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];

/// Index of the unit a value scales to, and the scaled value itself.
///
/// Divides by 1024 while the value is at least 1024 and a larger unit remains.
pub fn scale(value: u64, units: usize) -> (f64, usize) {
    let mut scaled = value as f64;
    let mut index = 0;
    while scaled >= 1024.0 && index < units - 1 {
        scaled /= 1024.0;
        index += 1;
    }
    (scaled, index)
}

fn format_with_units(value: u64, units: &[&str]) -> String {
    if value == 0 {
        return format!("0 {}", units[0]);
    }
    let (scaled, index) = scale(value, units.len());
    format!("{:.1} {}", scaled, units[index])
}

/// Formats a size in bytes, e.g. `1.5 MB`
pub fn format_size(bytes: u64) -> String {
    format_with_units(bytes, &SIZE_UNITS)
}

/// Formats a transfer rate in bytes per second, e.g. `512.0 KB/s`
pub fn format_speed(bytes_per_sec: u64) -> String {
    format_with_units(bytes_per_sec, &SPEED_UNITS)
}

/// Estimated time remaining for a transfer, or `Unknown` when it cannot be
/// estimated (stalled, unknown size, or already done).
pub fn format_eta(remaining_bytes: u64, bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 || remaining_bytes == 0 {
        return "Unknown".to_string();
    }
    let secs = remaining_bytes.div_ceil(bytes_per_sec);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
