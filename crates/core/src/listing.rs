//! Unix-style directory listing lines.
//!
//! Both the FTP `LIST` reply and the SFTP `SSH_FXP_NAME` longname field use
//! the `ls -l` shape. Timestamps are derived without a calendar dependency.

use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Broken-down UTC time, enough for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilTime {
    pub year: i64,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Converts Unix seconds to a civil date (Howard Hinnant's
/// days-from-civil inverse, valid far beyond any mtime we will see).
pub fn civil_from_unix(secs: i64) -> CivilTime {
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = if month <= 2 { y + 1 } else { y };

    CivilTime {
        year,
        month,
        day,
        hour: (rem / 3600) as u32,
        minute: (rem % 3600 / 60) as u32,
        second: (rem % 60) as u32,
    }
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// `rwxr-xr-x`-style permission string from a Unix mode.
pub fn mode_string(mode: u32, is_dir: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });

    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    out
}

/// `Jan  2 15:04` for the current year, `Jan  2  2006` otherwise, matching
/// ls convention.
pub fn list_timestamp(modified: SystemTime, now: SystemTime) -> String {
    let time = civil_from_unix(unix_seconds(modified));
    let current = civil_from_unix(unix_seconds(now));
    let month = MONTHS[(time.month - 1) as usize];

    if time.year == current.year {
        format!("{} {:>2} {:02}:{:02}", month, time.day, time.hour, time.minute)
    } else {
        format!("{} {:>2}  {}", month, time.day, time.year)
    }
}

/// One `ls -l`-shaped line for a directory entry.
pub fn long_line(name: &str, metadata: &Metadata, now: SystemTime) -> String {
    #[cfg(unix)]
    let (mode, links, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (
            metadata.mode() & 0o7777,
            metadata.nlink(),
            metadata.uid(),
            metadata.gid(),
        )
    };
    #[cfg(not(unix))]
    let (mode, links, uid, gid) = (0o644u32, 1u64, 0u32, 0u32);

    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);

    format!(
        "{} {:>3} {:<8} {:<8} {:>12} {} {}",
        mode_string(mode, metadata.is_dir()),
        links,
        uid,
        gid,
        metadata.len(),
        list_timestamp(modified, now),
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn civil_conversion_known_dates() {
        // 2024-02-29T12:30:45Z
        let t = civil_from_unix(1_709_209_845);
        assert_eq!((t.year, t.month, t.day), (2024, 2, 29));
        assert_eq!((t.hour, t.minute, t.second), (12, 30, 45));

        // Epoch.
        let t = civil_from_unix(0);
        assert_eq!((t.year, t.month, t.day, t.hour), (1970, 1, 1, 0));
    }

    #[test]
    fn mode_strings() {
        assert_eq!(mode_string(0o644, false), "-rw-r--r--");
        assert_eq!(mode_string(0o755, true), "drwxr-xr-x");
        assert_eq!(mode_string(0o000, false), "----------");
    }

    #[test]
    fn timestamp_switches_format_across_years() {
        let modified = UNIX_EPOCH + Duration::from_secs(1_709_209_845); // 2024-02-29
        let same_year = UNIX_EPOCH + Duration::from_secs(1_720_000_000); // 2024-07
        let later_year = UNIX_EPOCH + Duration::from_secs(1_760_000_000); // 2025-10

        assert_eq!(list_timestamp(modified, same_year), "Feb 29 12:30");
        assert_eq!(list_timestamp(modified, later_year), "Feb 29  2024");
    }

    #[test]
    fn long_line_contains_name_and_size() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"12345").unwrap();
        let metadata = std::fs::metadata(file.path()).unwrap();

        let line = long_line("hello.txt", &metadata, SystemTime::now());

        assert!(line.ends_with("hello.txt"));
        assert!(line.contains("    5 "));
        assert!(line.starts_with('-'));
    }
}
