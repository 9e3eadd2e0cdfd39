use std::time;

/// Get the current system time in epoch format.
///
/// # Panics
///
/// Panics if the system time is before epoch.
pub fn now_from_epoch() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .expect("system time is before epoch")
        .as_secs()
}

/// Formats a byte count for human consumption.
#[must_use]
pub fn format_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    #[allow(clippy::cast_precision_loss)]
    let size = size as f64;
    if size < KB {
        format!("{size:.0} B")
    } else if size < MB {
        format!("{:.1} KB", size / KB)
    } else if size < GB {
        format!("{:.2} MB", size / MB)
    } else {
        format!("{:.2} GB", size / GB)
    }
}

/// Formats a transfer speed in bytes per second.
#[must_use]
pub fn format_speed(speed: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;

    if speed < KB {
        format!("{speed:.0} B/s")
    } else if speed < MB {
        format!("{:.1} KB/s", speed / KB)
    } else {
        format!("{:.2} MB/s", speed / MB)
    }
}

/// Formats a duration in whole seconds, with `"--"` for non-positive values.
#[must_use]
pub fn format_seconds(seconds: i64) -> String {
    if seconds <= 0 {
        return String::from("--");
    }
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn speed_units() {
        assert_eq!(format_speed(100.0), "100 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KB/s");
        assert_eq!(format_speed(2.0 * 1024.0 * 1024.0), "2.00 MB/s");
    }

    #[test]
    fn seconds_sentinel() {
        assert_eq!(format_seconds(0), "--");
        assert_eq!(format_seconds(-5), "--");
        assert_eq!(format_seconds(42), "42s");
        assert_eq!(format_seconds(90), "1m30s");
        assert_eq!(format_seconds(3720), "1h2m");
    }
}
