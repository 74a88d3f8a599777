//! Timestamp parsing and formatting.
//!
//! The wire representation ([`SyslogTime`], defined next to the record
//! framing) keeps every field of the original timestamp including the
//! fractional-second precision, which is why the calendar types from
//! `chrono` only appear at the edges: acquiring the current time and
//! converting to unix seconds.

use chrono::{Datelike, Local, NaiveDate, Offset, Timelike};

pub use weir_buffers::SyslogTime;

const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Captures the current wall-clock time as a syslog timestamp plus unix
/// seconds, from a single clock read.
pub fn now() -> (SyslogTime, i64) {
    let now = Local::now();
    let offset_secs = now.offset().fix().local_minus_utc();
    let (mode, abs) = if offset_secs < 0 {
        (b'-', -offset_secs as u32)
    } else {
        (b'+', offset_secs as u32)
    };
    let t = SyslogTime {
        time_type: 1,
        year: now.year(),
        month: now.month(),
        day: now.day(),
        hour: now.hour(),
        minute: now.minute(),
        second: now.second(),
        secfrac: now.timestamp_subsec_micros(),
        secfrac_precision: 6,
        offset_mode: mode,
        offset_hour: abs / 3600,
        offset_minute: (abs % 3600) / 60,
    };
    (t, now.timestamp())
}

/// Converts to unix seconds, honoring the recorded UTC offset.
pub fn to_unix_seconds(t: &SyslogTime) -> i64 {
    let days = NaiveDate::from_ymd_opt(t.year, t.month, t.day)
        .map(|d| i64::from(d.num_days_from_ce()) - 719_163)
        .unwrap_or(0);
    let local = days * 86_400
        + i64::from(t.hour) * 3_600
        + i64::from(t.minute) * 60
        + i64::from(t.second);
    let offset = i64::from(t.offset_hour) * 3_600 + i64::from(t.offset_minute) * 60;
    if t.offset_mode == b'-' {
        local + offset
    } else {
        local - offset
    }
}

/// `Mmm dd hh:mm:ss` with a space-padded day, as in BSD syslog.
pub fn format_rfc3164(t: &SyslogTime) -> String {
    let month = MONTH_NAMES
        .get(t.month.wrapping_sub(1) as usize)
        .unwrap_or(&"Jan");
    format!(
        "{month} {day:2} {hour:02}:{minute:02}:{second:02}",
        day = t.day,
        hour = t.hour,
        minute = t.minute,
        second = t.second
    )
}

/// RFC 3339 with the original fractional-second precision.
pub fn format_rfc3339(t: &SyslogTime) -> String {
    let mut out = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        t.year, t.month, t.day, t.hour, t.minute, t.second
    );
    if t.secfrac_precision > 0 {
        out.push('.');
        out.push_str(&format!(
            "{:0width$}",
            t.secfrac,
            width = t.secfrac_precision as usize
        ));
    }
    out.push(t.offset_mode as char);
    out.push_str(&format!("{:02}:{:02}", t.offset_hour, t.offset_minute));
    out
}

/// `YYYYMMDDhhmmss`, the format MySQL consumes directly.
pub fn format_mysql(t: &SyslogTime) -> String {
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        t.year, t.month, t.day, t.hour, t.minute, t.second
    )
}

/// `YYYY-MM-DD hh:mm:ss` for PostgreSQL.
pub fn format_pgsql(t: &SyslogTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year, t.month, t.day, t.hour, t.minute, t.second
    )
}

/// The sub-second fraction alone, zero-padded to its precision.
pub fn format_secfrac(t: &SyslogTime) -> String {
    if t.secfrac_precision == 0 {
        "0".to_string()
    } else {
        format!("{:0width$}", t.secfrac, width = t.secfrac_precision as usize)
    }
}

fn digits(buf: &[u8], pos: &mut usize, min: usize, max: usize) -> Option<u32> {
    let start = *pos;
    let mut val: u32 = 0;
    while *pos < buf.len() && buf[*pos].is_ascii_digit() && *pos - start < max {
        val = val * 10 + u32::from(buf[*pos] - b'0');
        *pos += 1;
    }
    if *pos - start < min {
        None
    } else {
        Some(val)
    }
}

fn expect(buf: &[u8], pos: &mut usize, c: u8) -> Option<()> {
    if *pos < buf.len() && buf[*pos] == c {
        *pos += 1;
        Some(())
    } else {
        None
    }
}

/// Parses an RFC 3339 timestamp at `*pos`, advancing past it (and one
/// trailing space, if present) on success. On failure `*pos` is untouched.
pub fn parse_rfc3339(buf: &[u8], pos: &mut usize) -> Option<SyslogTime> {
    let mut p = *pos;
    let year = digits(buf, &mut p, 4, 4)? as i32;
    expect(buf, &mut p, b'-')?;
    let month = digits(buf, &mut p, 2, 2)?;
    expect(buf, &mut p, b'-')?;
    let day = digits(buf, &mut p, 2, 2)?;
    expect(buf, &mut p, b'T')?;
    let hour = digits(buf, &mut p, 2, 2)?;
    expect(buf, &mut p, b':')?;
    let minute = digits(buf, &mut p, 2, 2)?;
    expect(buf, &mut p, b':')?;
    let second = digits(buf, &mut p, 2, 2)?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 59 {
        return None;
    }

    let mut secfrac = 0;
    let mut secfrac_precision = 0u8;
    if p < buf.len() && buf[p] == b'.' {
        p += 1;
        let start = p;
        secfrac = digits(buf, &mut p, 1, 9)?;
        secfrac_precision = (p - start) as u8;
    }

    let (offset_mode, offset_hour, offset_minute) = if p < buf.len() && (buf[p] == b'Z' || buf[p] == b'z') {
        p += 1;
        (b'+', 0, 0)
    } else if p < buf.len() && (buf[p] == b'+' || buf[p] == b'-') {
        let mode = buf[p];
        p += 1;
        let oh = digits(buf, &mut p, 2, 2)?;
        expect(buf, &mut p, b':')?;
        let om = digits(buf, &mut p, 2, 2)?;
        if oh > 23 || om > 59 {
            return None;
        }
        (mode, oh, om)
    } else {
        return None;
    };

    // The timestamp must be delimited; eat a single trailing space.
    if p < buf.len() {
        if buf[p] != b' ' {
            return None;
        }
        p += 1;
    }

    *pos = p;
    Some(SyslogTime {
        time_type: 2,
        year,
        month,
        day,
        hour,
        minute,
        second,
        secfrac,
        secfrac_precision,
        offset_mode,
        offset_hour,
        offset_minute,
    })
}

/// Parses a BSD `Mmm dd hh:mm:ss` timestamp at `*pos`, advancing past it
/// (and one trailing space) on success. With `detect_year`, a four-digit
/// year directly after the timestamp is recognized and consumed. Year and
/// offset fields are filled from the current clock since the legacy format
/// carries neither.
pub fn parse_rfc3164(buf: &[u8], pos: &mut usize, detect_year: bool) -> Option<SyslogTime> {
    let mut p = *pos;
    if buf.len() < p + 15 {
        return None;
    }
    let month = MONTH_NAMES
        .iter()
        .position(|m| buf[p..].starts_with(m.as_bytes()))? as u32
        + 1;
    p += 3;
    expect(buf, &mut p, b' ')?;
    // Day of month, space- or zero-padded.
    if buf[p] == b' ' {
        p += 1;
    }
    let day = digits(buf, &mut p, 1, 2)?;
    expect(buf, &mut p, b' ')?;
    let hour = digits(buf, &mut p, 2, 2)?;
    expect(buf, &mut p, b':')?;
    let minute = digits(buf, &mut p, 2, 2)?;
    expect(buf, &mut p, b':')?;
    let second = digits(buf, &mut p, 2, 2)?;

    if !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 59 {
        return None;
    }

    let (now, _) = now();
    let mut year = now.year;

    if detect_year && p + 5 <= buf.len() && buf[p] == b' ' {
        let mut q = p + 1;
        if let Some(y) = digits(buf, &mut q, 4, 4) {
            if (1970..=2200).contains(&y) && (q >= buf.len() || buf[q] == b' ') {
                year = y as i32;
                p = q;
            }
        }
    }

    if p < buf.len() {
        if buf[p] != b' ' {
            return None;
        }
        p += 1;
    }

    *pos = p;
    Some(SyslogTime {
        time_type: 1,
        year,
        month,
        day,
        hour,
        minute,
        second,
        secfrac: 0,
        secfrac_precision: 0,
        offset_mode: now.offset_mode,
        offset_hour: now.offset_hour,
        offset_minute: now.offset_minute,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3164_happy_path() {
        let buf = b"Oct 11 22:14:15 mymachine su: 'su root' failed";
        let mut pos = 0;
        let t = parse_rfc3164(buf, &mut pos, false).unwrap();
        assert_eq!((t.month, t.day, t.hour, t.minute, t.second), (10, 11, 22, 14, 15));
        assert_eq!(&buf[pos..], b"mymachine su: 'su root' failed");
    }

    #[test]
    fn rfc3164_space_padded_day() {
        let buf = b"Jan  3 01:02:03 host tag: x";
        let mut pos = 0;
        let t = parse_rfc3164(buf, &mut pos, false).unwrap();
        assert_eq!((t.month, t.day), (1, 3));
        assert_eq!(&buf[pos..], b"host tag: x");
    }

    #[test]
    fn rfc3164_year_detection() {
        let buf = b"Oct 11 22:14:15 2009 host tag: x";
        let mut pos = 0;
        let t = parse_rfc3164(buf, &mut pos, true).unwrap();
        assert_eq!(t.year, 2009);
        assert_eq!(&buf[pos..], b"host tag: x");

        // Without the option, the year stays in the message.
        let mut pos = 0;
        let _t = parse_rfc3164(buf, &mut pos, false).unwrap();
        assert_eq!(&buf[pos..], b"2009 host tag: x");
    }

    #[test]
    fn rfc3164_rejects_garbage() {
        let mut pos = 0;
        assert!(parse_rfc3164(b"NotAMonth 1 00:00:00 x", &mut pos, false).is_none());
        assert_eq!(pos, 0);
    }

    #[test]
    fn rfc3339_with_fraction_and_offset() {
        let buf = b"2003-10-11T22:14:15.003-07:00 host app - - - msg";
        let mut pos = 0;
        let t = parse_rfc3339(buf, &mut pos).unwrap();
        assert_eq!(t.year, 2003);
        assert_eq!(t.secfrac, 3);
        assert_eq!(t.secfrac_precision, 3);
        assert_eq!(t.offset_mode, b'-');
        assert_eq!(t.offset_hour, 7);
        assert_eq!(&buf[pos..], b"host app - - - msg");
    }

    #[test]
    fn rfc3339_zulu() {
        let buf = b"2003-08-24T05:14:15Z rest";
        let mut pos = 0;
        let t = parse_rfc3339(buf, &mut pos).unwrap();
        assert_eq!((t.offset_mode, t.offset_hour, t.offset_minute), (b'+', 0, 0));
        assert_eq!(&buf[pos..], b"rest");
    }

    #[test]
    fn formatting_matches_fields() {
        let t = SyslogTime {
            time_type: 2,
            year: 2003,
            month: 10,
            day: 11,
            hour: 22,
            minute: 14,
            second: 15,
            secfrac: 3,
            secfrac_precision: 3,
            offset_mode: b'-',
            offset_hour: 7,
            offset_minute: 0,
        };
        assert_eq!(format_rfc3164(&t), "Oct 11 22:14:15");
        assert_eq!(format_rfc3339(&t), "2003-10-11T22:14:15.003-07:00");
        assert_eq!(format_mysql(&t), "20031011221415");
        assert_eq!(format_pgsql(&t), "2003-10-11 22:14:15");
        assert_eq!(format_secfrac(&t), "003");
    }

    #[test]
    fn unix_seconds_accounts_for_offset() {
        let mut t = SyslogTime {
            time_type: 2,
            year: 1970,
            month: 1,
            day: 1,
            hour: 1,
            minute: 0,
            second: 0,
            secfrac: 0,
            secfrac_precision: 0,
            offset_mode: b'+',
            offset_hour: 1,
            offset_minute: 0,
        };
        // 01:00 at +01:00 is midnight UTC.
        assert_eq!(to_unix_seconds(&t), 0);
        t.offset_mode = b'-';
        assert_eq!(to_unix_seconds(&t), 7_200);
    }
}
