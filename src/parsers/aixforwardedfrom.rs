//! Transform parser for AIX `Message forwarded from <host>:` preambles.
//!
//! AIX relays replace the hostname with a `Message forwarded from` notice.
//! This parser removes the preamble so the real hostname takes its place,
//! drops the stray colon after it, and then yields to the next parser.

use weir_core::Message;

use super::{Parser, ParseResult};

const OPENING: &[u8] = b"Message forwarded from ";

/// Minimum plausible length: a 16-byte timestamp, the preamble, a one-byte
/// hostname, and `: `.
const MIN_LEN: usize = 42;

pub struct AixForwardedFromParser;

impl Parser for AixForwardedFromParser {
    fn name(&self) -> &'static str {
        "aixforwardedfrom"
    }

    fn parse(&self, msg: &mut Message) -> ParseResult {
        let raw = msg.after_pri();
        let base = msg.after_pri_offset();
        let mut pos = 0;
        while pos < raw.len() && raw[pos] == b' ' {
            pos += 1;
        }
        let rest = &raw[pos..];
        if rest.len() < MIN_LEN {
            return ParseResult::CouldNotParse;
        }

        // The preamble sits where the hostname should be, right after the
        // 16-byte timestamp.
        let after_ts = &rest[16..];
        if !after_ts.starts_with(OPENING) {
            return ParseResult::CouldNotParse;
        }

        // The hostname must be terminated by a colon; a space first means
        // this only looked like an AIX preamble.
        let host = &after_ts[OPENING.len()..];
        let mut i = 0;
        while i < host.len() && host[i] != b' ' && host[i] != b':' {
            i += 1;
        }
        if i < host.len() && host[i] != b':' {
            debug!("preamble matched but hostname is not colon-terminated, leaving record");
            return ParseResult::CouldNotParse;
        }

        let preamble_at = base + pos + 16;
        let colon_at = preamble_at + OPENING.len() + i;
        msg.with_raw_mut(|buf| {
            // Drop the colon first so the earlier index stays valid.
            if colon_at < buf.len() {
                buf.remove(colon_at);
            }
            buf.drain(preamble_at..preamble_at + OPENING.len());
        });
        debug!("removed AIX forwarded-from preamble");
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
        let result = AixForwardedFromParser.parse(&mut msg);
        (msg, result)
    }

    #[test]
    fn rewrites_the_preamble_into_a_hostname() {
        let (msg, result) = run(
            b"<13>Oct 11 22:14:15 Message forwarded from aixhost: sshd[123]: accepted",
        );
        assert_eq!(result, ParseResult::CouldNotParse);
        assert_eq!(
            msg.raw(),
            &b"<13>Oct 11 22:14:15 aixhost sshd[123]: accepted"[..]
        );
    }

    #[test]
    fn similar_preamble_without_colon_is_left_mostly_alone() {
        let raw = b"<13>Oct 11 22:14:15 Message forwarded from somewhere else entirely";
        let (_msg, result) = run(raw);
        assert_eq!(result, ParseResult::CouldNotParse);
    }

    #[test]
    fn short_records_pass_through() {
        let raw = b"<13>Oct 11 22:14:15 short";
        let (msg, result) = run(raw);
        assert_eq!(result, ParseResult::CouldNotParse);
        assert_eq!(msg.raw(), raw);
    }
}
