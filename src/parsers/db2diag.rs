//! Parser for DB2 diagnostic log records.
//!
//! db2diag lines carry a severity word at a fixed column, a timestamp at
//! another, and the PID/program pair at a fixed distance from each other.
//! All positions are configurable because DB2 versions shuffle them
//! around. Every scan below is bounded by the record end; a truncated
//! record is passed on rather than parsed partially.

use serde::Deserialize;

use chrono::NaiveDateTime;

use weir_core::{Message, SyslogTime};

use super::{Parser, ParseResult};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Db2DiagConfig {
    /// Column of the severity word, relative to the record start.
    pub levelpos: usize,
    /// Column of the timestamp.
    pub timepos: usize,
    /// `strftime`-style format of the timestamp up to the seconds.
    pub timeformat: String,
    /// Distance from the start of the PID to the start of the program
    /// name.
    pub pidstarttoprogstartshift: usize,
}

impl Default for Db2DiagConfig {
    fn default() -> Self {
        Db2DiagConfig {
            levelpos: 59,
            timepos: 0,
            timeformat: "%Y-%m-%d-%H.%M.%S".to_string(),
            pidstarttoprogstartshift: 49,
        }
    }
}

pub struct Db2DiagParser {
    cfg: Db2DiagConfig,
}

impl Db2DiagParser {
    pub fn new(cfg: Db2DiagConfig) -> Self {
        Db2DiagParser { cfg }
    }

    /// Maps the DB2 level word to a syslog severity and the word's length.
    fn level(level: &[u8]) -> Option<(u8, usize)> {
        match level.first()? {
            b'C' => Some((0, 8)), // Critical
            b'A' => Some((1, 5)), // Alert
            b'S' => Some((2, 6)), // Severe
            b'E' => {
                // Error or Event
                if level.get(1) == Some(&b'r') {
                    Some((3, 5))
                } else {
                    Some((5, 5))
                }
            }
            b'W' => Some((4, 7)), // Warning
            b'I' => Some((6, 4)), // Info
            b'D' => Some((7, 5)), // Debug
            _ => None,
        }
    }

    /// Parses the timestamp plus the `.frac±offset` suffix DB2 appends.
    fn timestamp(&self, text: &str) -> Option<SyslogTime> {
        let (dt, rest) = NaiveDateTime::parse_and_remainder(text, &self.cfg.timeformat).ok()?;
        // Fractional part and a timezone offset in minutes, e.g.
        // `.012345+120`.
        let rest = rest.strip_prefix('.')?;
        let frac_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let secfrac: u32 = rest[..frac_end].parse().unwrap_or(0);
        let precision = frac_end.min(9) as u8;

        let mut offset_mode = b'+';
        let mut offset_minutes = 0u32;
        let tail = &rest[frac_end..];
        if let Some(stripped) = tail.strip_prefix('+').or_else(|| tail.strip_prefix('-')) {
            offset_mode = tail.as_bytes()[0];
            let num_end = stripped
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(stripped.len());
            offset_minutes = stripped[..num_end].parse().unwrap_or(0);
        }

        use chrono::{Datelike, Timelike};
        Some(SyslogTime {
            time_type: 2,
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            secfrac,
            secfrac_precision: precision,
            offset_mode,
            offset_hour: offset_minutes / 60,
            offset_minute: offset_minutes % 60,
        })
    }
}

impl Parser for Db2DiagParser {
    fn name(&self) -> &'static str {
        "db2diag"
    }

    fn parse(&self, msg: &mut Message) -> ParseResult {
        let raw = msg.after_pri().to_vec();
        if raw.len() < self.cfg.levelpos + 4 {
            return ParseResult::CouldNotParse;
        }

        let Some((severity, level_len)) = Self::level(&raw[self.cfg.levelpos..]) else {
            // No recognizable level word; accept the record unchanged.
            return ParseResult::Parsed;
        };
        if raw.len() < self.cfg.levelpos + level_len {
            return ParseResult::CouldNotParse;
        }
        msg.set_severity(severity);

        if self.cfg.timepos < raw.len() {
            let text = String::from_utf8_lossy(&raw[self.cfg.timepos..]);
            if let Some(t) = self.timestamp(&text) {
                msg.set_reported_time(t);
            }
        }

        // PID: after the colon following the level word, two bytes in.
        let after_level = self.cfg.levelpos + level_len;
        let Some(colon) = raw[after_level..].iter().position(|&b| b == b':') else {
            return ParseResult::Parsed;
        };
        let pid_start = after_level + colon + 2;
        if pid_start >= raw.len() {
            return ParseResult::Parsed;
        }
        let Some(pid_len) = raw[pid_start..].iter().position(|&b| b == b' ') else {
            return ParseResult::Parsed;
        };
        msg.set_proc_id(String::from_utf8_lossy(&raw[pid_start..pid_start + pid_len]).into_owned());

        // Program name: a fixed shift from the PID start, ended by a space
        // or a backslash, whichever comes first inside the record.
        let prog_start = pid_start + self.cfg.pidstarttoprogstartshift;
        if prog_start >= raw.len() {
            return ParseResult::Parsed;
        }
        let prog = &raw[prog_start..];
        let space = prog.iter().position(|&b| b == b' ').unwrap_or(prog.len());
        let backslash = prog.iter().position(|&b| b == b'\\').unwrap_or(prog.len());
        let prog_len = space.min(backslash);
        msg.set_app_name(String::from_utf8_lossy(&prog[..prog_len]).into_owned());

        ParseResult::Parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::pri::parse_pri;

    // Builds a record whose columns line up with the defaults: the level
    // word at 59, the pid two bytes after the label colon, the program 49
    // bytes after the pid start.
    fn sample() -> Vec<u8> {
        let mut s = String::from("2024-03-11-06.27.31.337234+060 I1583E458");
        while s.len() < 52 {
            s.push(' ');
        }
        s.push_str("LEVEL: Error\n");
        s.push_str("PID : ");
        let pid_start = s.len();
        s.push_str("1234567");
        while s.len() < pid_start + 42 {
            s.push(' ');
        }
        s.push_str("PROC : ");
        debug_assert_eq!(s.len(), pid_start + 49);
        s.push_str("db2sysc 0 (idle)\n");
        s.push_str("rest of record");
        s.into_bytes()
    }

    fn run(cfg: Db2DiagConfig, raw: &[u8]) -> (Message, ParseResult) {
        let mut msg = Message::new();
        msg.set_raw(raw);
        msg.apply_pri(parse_pri(raw));
        let result = Db2DiagParser::new(cfg).parse(&mut msg);
        (msg, result)
    }

    #[test]
    fn extracts_level_time_pid_and_program() {
        let (msg, result) = run(Db2DiagConfig::default(), &sample());
        assert_eq!(result, ParseResult::Parsed);
        // "Error" maps to syslog err.
        assert_eq!(msg.severity(), 3);
        let t = msg.reported_time();
        assert_eq!((t.year, t.month, t.day), (2024, 3, 11));
        assert_eq!((t.hour, t.minute, t.second), (6, 27, 31));
        assert_eq!(t.secfrac, 337_234);
        assert_eq!((t.offset_mode, t.offset_hour), (b'+', 1));
        assert_eq!(msg.proc_id(), "1234567");
        assert_eq!(msg.app_name(), "db2sysc");
    }

    #[test]
    fn severity_mapping_covers_all_levels() {
        for (word, sev) in [
            (&b"Critical"[..], 0u8),
            (b"Alert", 1),
            (b"Severe", 2),
            (b"Error", 3),
            (b"Event", 5),
            (b"Warning", 4),
            (b"Info", 6),
            (b"Debug", 7),
        ] {
            let (got, _len) = Db2DiagParser::level(word).unwrap();
            assert_eq!(got, sev, "level {:?}", std::str::from_utf8(word).unwrap());
        }
    }

    #[test]
    fn truncated_record_is_passed_on() {
        let (_msg, result) = run(Db2DiagConfig::default(), b"<13>way too short");
        assert_eq!(result, ParseResult::CouldNotParse);
    }

    #[test]
    fn unknown_level_word_accepts_record_unchanged() {
        let mut raw = sample();
        // Overwrite "Error" with an unknown word.
        raw[59..64].copy_from_slice(b"Xyzzy");
        let (msg, result) = run(Db2DiagConfig::default(), &raw);
        assert_eq!(result, ParseResult::Parsed);
        // Severity stays at the PRI default.
        assert_eq!(msg.severity(), 5);
    }

    #[test]
    fn program_name_is_bounded_by_backslash() {
        let mut raw = sample();
        let prog_area = raw.windows(9).position(|w| w == b"db2sysc 0").unwrap();
        raw[prog_area + 3] = b'\\';
        let (msg, _) = run(Db2DiagConfig::default(), &raw);
        assert_eq!(msg.app_name(), "db2");
    }
}
