//! Transform parser for Cisco records whose tag got mangled to `: %`.
//!
//! Some Cisco IOS configurations emit `host : %FACILITY-SEV-MNEMONIC:`
//! instead of a proper syslog tag. This parser strips the stray `: ` so
//! `%FACILITY-...` becomes the tag, then reports `CouldNotParse` on
//! purpose: the now-normalized record is for the next parser in the chain.

use weir_core::Message;

use super::{Parser, ParseResult};

/// Minimum plausible length: a 16-byte timestamp, a one-byte name, and
/// `` : %ASA-1-000000: ``.
const MIN_LEN: usize = 34;

pub struct CiscoNamesParser;

impl Parser for CiscoNamesParser {
    fn name(&self) -> &'static str {
        "cisconames"
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

        // Two timestamp shapes: `Mmm DD HH:MM:SS ` (16 chars) or with the
        // year, `Mmm DD YYYY HH:MM:SS ` (21 chars). Check the colons first,
        // they differ fastest.
        let ts_len = if rest[9] == b':' && rest[12] == b':' && rest[3] == b' ' && rest[6] == b' ' && rest[15] == b' ' {
            16
        } else if rest[14] == b':'
            && rest[17] == b':'
            && rest[3] == b' '
            && rest[6] == b' '
            && rest[11] == b' '
            && rest[20] == b' '
        {
            21
        } else {
            return ParseResult::CouldNotParse;
        };

        // Walk past the hostname to the next space.
        let mut i = ts_len;
        while i < rest.len() && rest[i] != b' ' {
            i += 1;
        }
        i += 1;
        if i >= rest.len() || !rest[i..].starts_with(b": %") {
            return ParseResult::CouldNotParse;
        }

        // Remove the stray `: ` so the `%...` mnemonic becomes the tag,
        // then let the next parser handle the normalized record.
        let at = base + pos + i;
        msg.with_raw_mut(|buf| {
            buf.drain(at..at + 2);
        });
        debug!("normalized a name-mangled Cisco record");
        ParseResult::CouldNotParse
    }
}
