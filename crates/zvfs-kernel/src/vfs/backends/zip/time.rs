//! DOS date/time conversion in local time.

use chrono::{Datelike, Local, TimeZone, Timelike};

/// 1980-01-01T00:00:00Z, used when a DOS stamp doesn't name a real time.
pub const DOS_EPOCH: i64 = 315_532_800;

/// Seconds since the Unix epoch for a DOS date and time.
pub fn dos_to_unix(dos_date: u16, dos_time: u16) -> i64 {
    let year = ((dos_date >> 9) & 0x7f) as i32 + 1980;
    let month = ((dos_date >> 5) & 0x0f) as u32;
    let day = (dos_date & 0x1f) as u32;
    let hour = ((dos_time >> 11) & 0x1f) as u32;
    let minute = ((dos_time >> 5) & 0x3f) as u32;
    let second = ((dos_time & 0x1f) * 2) as u32;
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .earliest()
        .map(|t| t.timestamp())
        .unwrap_or(DOS_EPOCH)
}

fn local(unix: i64) -> Option<chrono::DateTime<Local>> {
    Local.timestamp_opt(unix.max(DOS_EPOCH), 0).earliest()
}

/// DOS time field for a Unix timestamp.
pub fn to_dos_time(unix: i64) -> u16 {
    local(unix).map_or(0, |t| {
        ((t.hour() << 11) | (t.minute() << 5) | (t.second() >> 1)) as u16
    })
}

/// DOS date field for a Unix timestamp. Clamped to the 1980..=2107 range
/// the field can hold.
pub fn to_dos_date(unix: i64) -> u16 {
    local(unix).map_or((1 << 5) | 1, |t| {
        let year = (t.year() - 1980).clamp(0, 127) as u32;
        ((year << 9) | (t.month() << 5) | t.day()) as u16
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_even_seconds() {
        let when = Local
            .with_ymd_and_hms(2021, 6, 15, 13, 45, 30)
            .earliest()
            .unwrap()
            .timestamp();
        let back = dos_to_unix(to_dos_date(when), to_dos_time(when));
        assert_eq!(back, when);
    }

    #[test]
    fn test_odd_seconds_round_down() {
        let when = Local
            .with_ymd_and_hms(2000, 1, 2, 3, 4, 5)
            .earliest()
            .unwrap()
            .timestamp();
        let back = dos_to_unix(to_dos_date(when), to_dos_time(when));
        assert_eq!(back, when - 1);
    }

    #[test]
    fn test_invalid_stamp_falls_back() {
        // Month 0 doesn't exist.
        assert_eq!(dos_to_unix(0, 0), DOS_EPOCH);
    }
}
