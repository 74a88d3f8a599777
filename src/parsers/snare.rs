//! Transform parser for Snare agent records.
//!
//! Snare separates fields with tabs, which the sanitizer encodes as `#011`.
//! Two shapes exist: raw mode (`host<TAB>MSWinEventLog<TAB>...`) and
//! syslog-framed mode (timestamp and hostname first, then the tagged tab
//! soup). In both cases the tab encodings around the tag are rewritten to
//! plain spaces so hostname and tag parse normally downstream, and the
//! parser yields with `CouldNotParse`.

use weir_core::Message;

use super::{Parser, ParseResult};

const TAB_REPR: &[u8] = b"#011";
const TAGS: [&[u8]; 2] = [b"MSWinEventLog", b"LinuxKAudit"];

/// Length of the tab separator at `buf[i]`, if one is there.
fn tab_sep_len(buf: &[u8], i: usize) -> Option<usize> {
    if buf.get(i) == Some(&b'\t') {
        Some(1)
    } else if buf[i..].starts_with(TAB_REPR) {
        Some(TAB_REPR.len())
    } else {
        None
    }
}

/// Matches one of the known Snare tags at `buf[i]`, returning its length.
fn snare_tag_len(buf: &[u8], i: usize) -> Option<usize> {
    TAGS.iter()
        .find(|t| {
            buf.len() >= i + t.len() && buf[i..i + t.len()].eq_ignore_ascii_case(t)
        })
        .map(|t| t.len())
}

pub struct SnareParser;

impl SnareParser {
    /// Replaces the tab separator at `at` with a single space, in place.
    fn space_out(msg: &mut Message, at: usize, sep_len: usize) {
        msg.with_raw_mut(|buf| {
            buf[at] = b' ';
            if sep_len > 1 {
                buf.drain(at + 1..at + sep_len);
            }
        });
    }
}

impl Parser for SnareParser {
    fn name(&self) -> &'static str {
        "snare"
    }

    fn parse(&self, msg: &mut Message) -> ParseResult {
        let base = msg.after_pri_offset();
        let raw = msg.after_pri().to_vec();
        if raw.len() < 30 {
            // Too short to be a Snare record of either shape.
            return ParseResult::CouldNotParse;
        }

        // Find the first separator.
        let mut i = 0;
        while i < raw.len() && raw[i] != b' ' && raw[i] != b'\t' && raw[i] != b'#' {
            i += 1;
        }

        if let Some(sep1) = tab_sep_len(&raw, i) {
            // Raw mode: hostname, tab, tag, tab, fields.
            if let Some(tag_len) = snare_tag_len(&raw, i + sep1) {
                let tag_end = i + sep1 + tag_len;
                if let Some(sep2) = tab_sep_len(&raw, tag_end) {
                    debug!("found a Snare message in raw mode");
                    // Right-to-left so the first index stays valid.
                    Self::space_out(msg, base + tag_end, sep2);
                    Self::space_out(msg, base + i, sep1);
                }
            }
        } else if raw.len() > 17 {
            // Syslog-framed mode: skip the 16-byte timestamp, then the
            // hostname, and probe for the tag there.
            let mut j = 17;
            while j < raw.len() && raw[j] != b' ' {
                j += 1;
            }
            j += 1;
            if j < raw.len() {
                if let Some(tag_len) = snare_tag_len(&raw, j) {
                    let tag_end = j + tag_len;
                    if let Some(sep) = tab_sep_len(&raw, tag_end) {
                        debug!("found a Snare message in syslog-framed mode");
                        Self::space_out(msg, base + tag_end, sep);
                    }
                }
            }
        }

        // Transform-only: the (possibly rewritten) record goes to the next
        // parser either way.
        ParseResult::CouldNotParse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::pri::parse_pri;

    fn run(raw: &[u8]) -> (Message, ParseResult) {
        let mut msg = Message::new();
        msg.set_raw(raw);
        msg.apply_pri(parse_pri(raw));
        let result = SnareParser.parse(&mut msg);
        (msg, result)
    }

    #[test]
    fn raw_mode_with_encoded_tabs() {
        let (msg, result) = run(
            b"<13>winhost#011MSWinEventLog#0111#011Security#011123#011Fri Oct 11",
        );
        assert_eq!(result, ParseResult::CouldNotParse);
        assert_eq!(
            msg.raw(),
            &b"<13>winhost MSWinEventLog 1#011Security#011123#011Fri Oct 11"[..]
        );
    }

    #[test]
    fn raw_mode_with_real_tabs() {
        let (msg, result) = run(b"<13>winhost\tLinuxKAudit\taudit fields go here etc etc");
        assert_eq!(result, ParseResult::CouldNotParse);
        assert_eq!(
            msg.raw(),
            &b"<13>winhost LinuxKAudit audit fields go here etc etc"[..]
        );
    }

    #[test]
    fn syslog_framed_mode() {
        let (msg, result) = run(
            b"<13>Oct 11 22:14:15 winhost MSWinEventLog#0111#011Security#011more",
        );
        assert_eq!(result, ParseResult::CouldNotParse);
        assert_eq!(
            msg.raw(),
            &b"<13>Oct 11 22:14:15 winhost MSWinEventLog 1#011Security#011more"[..]
        );
    }

    #[test]
    fn unrelated_records_are_untouched() {
        let raw = b"<13>Oct 11 22:14:15 host tag: a perfectly normal message";
        let (msg, result) = run(raw);
        assert_eq!(result, ParseResult::CouldNotParse);
        assert_eq!(msg.raw(), raw);
    }

    #[test]
    fn short_records_are_untouched() {
        let raw = b"<13>tiny";
        let (msg, result) = run(raw);
        assert_eq!(result, ParseResult::CouldNotParse);
        assert_eq!(msg.raw(), raw);
    }
}
