//! Pass-through parser: accepts everything, parses nothing.
//!
//! Useful as a chain terminator when records should be taken as-is; the
//! body simply starts right after the PRI.

use weir_core::Message;

use super::{Parser, ParseResult};

pub struct DummyParser;

impl Parser for DummyParser {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn parse(&self, msg: &mut Message) -> ParseResult {
        let off = msg.after_pri_offset();
        msg.set_msg_offset(off);
        ParseResult::Parsed
    }
}
