//! Legacy syslog parser with structured-data support.
//!
//! Like the plain legacy parser, but after the tag it recognizes an
//! RFC 5424-style SD element (`[id k="v" ...]`, `\]` escapes allowed, `-`
//! for none) and stores it verbatim. The hostname heuristics are the
//! stricter original set: letters, digits, `.`, `_`, `-`, no options.

use weir_core::datetime;
use weir_core::message::flags;
use weir_core::pri::FACILITY_INVALID;
use weir_core::Message;

use super::{Parser, ParseResult};

const HOSTNAME_MAX: usize = 255;
const TAG_MAX: usize = 511;

/// Extracts one whole SD field starting at `pos`: `-`, or `[` up to the
/// first unescaped `]` that is followed by a space (or ends the record).
/// Returns the field and the position after its trailing space.
fn parse_structured_data(raw: &[u8], pos: usize) -> Option<(String, usize)> {
    let mut p = pos;
    while p < raw.len() && raw[p] == b' ' {
        p += 1;
    }
    if p >= raw.len() {
        return None;
    }
    if raw[p] == b'-' {
        let after = p + 1;
        if after < raw.len() && raw[after] != b' ' {
            return None;
        }
        return Some(("-".to_string(), (after + 1).min(raw.len())));
    }
    if raw[p] != b'[' {
        return None;
    }

    let mut sd = Vec::new();
    loop {
        if p >= raw.len() {
            return None;
        }
        if raw[p] == b'\\' && raw.get(p + 1) == Some(&b']') {
            // Escaped bracket: copy both, it does not end the element.
            sd.push(raw[p]);
            sd.push(raw[p + 1]);
            p += 2;
        } else if raw[p] == b']' && (p + 1 >= raw.len() || raw[p + 1] == b' ') {
            sd.push(raw[p]);
            p += 1;
            break;
        } else {
            sd.push(raw[p]);
            p += 1;
        }
    }
    // Eat the delimiting space.
    if p < raw.len() {
        p += 1;
    }
    Some((String::from_utf8_lossy(&sd).into_owned(), p))
}

pub struct Rfc3164SdParser;

impl Parser for Rfc3164SdParser {
    fn name(&self) -> &'static str {
        "rfc3164sd"
    }

    fn parse(&self, msg: &mut Message) -> ParseResult {
        msg.set_protocol_version(0);
        if msg.facility() == FACILITY_INVALID {
            msg.set_msg_offset(msg.after_pri_offset());
            return ParseResult::Parsed;
        }

        let raw = msg.raw().to_vec();
        let len = raw.len();
        let mut pos = msg.after_pri_offset();

        if let Some(t) = datetime::parse_rfc3339(&raw, &mut pos) {
            msg.set_reported_time(t);
        } else if let Some(t) = datetime::parse_rfc3164(&raw, &mut pos, false) {
            msg.set_reported_time(t);
        } else if pos + 1 < len && raw[pos] == b' ' {
            let mut retry = pos + 1;
            if let Some(t) = datetime::parse_rfc3164(&raw, &mut retry, false) {
                msg.set_reported_time(t);
                pos = retry;
            }
        }

        if msg.has_flag(flags::IGNORE_DATE) {
            msg.set_reported_time(*msg.rcvd_time());
        }

        if !msg.has_flag(flags::INTERNAL) {
            if pos < len && msg.has_flag(flags::PARSE_HOSTNAME) {
                let mut i = pos;
                while i < len
                    && i - pos < HOSTNAME_MAX
                    && (raw[i].is_ascii_alphanumeric()
                        || raw[i] == b'.'
                        || raw[i] == b'_'
                        || raw[i] == b'-')
                {
                    i += 1;
                }
                if i == len && i > pos {
                    msg.set_hostname(String::from_utf8_lossy(&raw[pos..i]).into_owned());
                    pos = i;
                } else if i > pos && raw[i] == b' ' && raw[i - 1].is_ascii_alphanumeric() {
                    msg.set_hostname(String::from_utf8_lossy(&raw[pos..i]).into_owned());
                    pos = i + 1;
                }
            }

            let tag_start = pos;
            let mut i = pos;
            while i < len && raw[i] != b':' && raw[i] != b' ' && i - tag_start < TAG_MAX {
                i += 1;
            }
            if i < len && raw[i] == b':' {
                i += 1;
            }
            msg.set_tag(String::from_utf8_lossy(&raw[tag_start..i]).into_owned());
            pos = i;
        }

        match parse_structured_data(&raw, pos) {
            Some((sd, after)) => {
                msg.set_structured_data(sd);
                pos = after;
            }
            None => msg.set_structured_data("-"),
        }

        msg.set_msg_offset(pos);
        ParseResult::Parsed
    }
}
