//! Parser for the classic `last message repeated n times` records.
//!
//! These carry no header at all, so the usual parsers would mangle them.
//! On a match the tag becomes empty and the reception time doubles as the
//! reported time.

use weir_core::Message;

use super::{Parser, ParseResult};

const OPENING: &[u8] = b"last message repeated ";
const CLOSING: &[u8] = b" times";

pub struct LastMsgParser;

impl Parser for LastMsgParser {
    fn name(&self) -> &'static str {
        "lastmsg"
    }

    fn parse(&self, msg: &mut Message) -> ParseResult {
        let raw = msg.after_pri();
        let mut pos = 0;
        while pos < raw.len() && raw[pos] == b' ' {
            pos += 1;
        }
        let rest = &raw[pos..];
        if rest.len() < OPENING.len() + CLOSING.len() + 1 {
            return ParseResult::CouldNotParse;
        }
        if !rest[..OPENING.len()].eq_ignore_ascii_case(OPENING) {
            return ParseResult::CouldNotParse;
        }
        let mut i = OPENING.len();
        let digits_start = i;
        while i < rest.len() && rest[i].is_ascii_digit() {
            i += 1;
        }
        // The closing text must account for exactly the remainder.
        if i == digits_start
            || rest.len() - i != CLOSING.len()
            || !rest[i..].eq_ignore_ascii_case(CLOSING)
        {
            return ParseResult::CouldNotParse;
        }

        debug!("detected a \"last message repeated n times\" message");
        msg.set_protocol_version(0);
        msg.set_reported_time(*msg.rcvd_time());
        let off = msg.after_pri_offset();
        msg.set_msg_offset(off);
        msg.set_tag("");
        ParseResult::Parsed
    }
}
