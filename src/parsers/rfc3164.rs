//! Legacy (BSD) syslog parser.
//!
//! Header detection is heuristic and grown over decades of real-world
//! traffic; the rules below are not RFC 3164-pure on purpose. Notable
//! deviations: the tag is ended only by `:` or space (the colon belongs to
//! the tag, the space to the content), and a "hostname" containing
//! characters that never appear in hostnames is reclassified as the tag.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Deserialize;

use weir_core::datetime;
use weir_core::message::flags;
use weir_core::pri::FACILITY_INVALID;
use weir_core::Message;

use super::{Parser, ParseResult};

const HOSTNAME_MAX: usize = 255;
const TAG_MAX: usize = 511;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Rfc3164Config {
    #[serde(rename = "detect.yearaftertimestamp")]
    pub detect_year_after_timestamp: bool,
    #[serde(rename = "permit.squarebracketsinhostname")]
    pub permit_square_brackets_in_hostname: bool,
    #[serde(rename = "permit.slashesinhostname")]
    pub permit_slashes_in_hostname: bool,
    #[serde(rename = "permit.atsignsinhostname")]
    pub permit_at_signs_in_hostname: bool,
    #[serde(rename = "force.tagendingbycolon")]
    pub force_tag_ending_by_colon: bool,
    #[serde(rename = "remove.msgfirstspace")]
    pub remove_msg_first_space: bool,
    #[serde(rename = "detect.headerless")]
    pub detect_headerless: bool,
    #[serde(rename = "headerless.hostname")]
    pub headerless_hostname: Option<String>,
    #[serde(rename = "headerless.tag")]
    pub headerless_tag: Option<String>,
    #[serde(rename = "headerless.ruleset")]
    pub headerless_ruleset: Option<String>,
    #[serde(rename = "headerless.errorfile")]
    pub headerless_error_file: Option<PathBuf>,
    #[serde(rename = "headerless.drop")]
    pub headerless_drop: bool,
}

pub struct Rfc3164Parser {
    cfg: Rfc3164Config,
    /// Error file handle; closed on HUP and reopened on the next write to
    /// cooperate with log rotation.
    err_file: Mutex<Option<File>>,
}

impl Rfc3164Parser {
    pub fn new(cfg: Rfc3164Config) -> Self {
        Rfc3164Parser {
            cfg,
            err_file: Mutex::new(None),
        }
    }

    /// Fills in configured defaults for a record that carries no header,
    /// optionally logging the raw record to the error file.
    fn handle_headerless(&self, msg: &mut Message, body_at: usize) -> ParseResult {
        let hostname = self
            .cfg
            .headerless_hostname
            .clone()
            .or_else(|| msg.rcv_from().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        msg.set_hostname(hostname);
        msg.set_tag(
            self.cfg
                .headerless_tag
                .clone()
                .unwrap_or_else(|| "headerless".to_string()),
        );
        msg.set_msg_offset(body_at);
        msg.add_flags(flags::HEADERLESS);
        if let Some(ruleset) = &self.cfg.headerless_ruleset {
            msg.set_ruleset(ruleset.clone());
        }

        if let Some(path) = &self.cfg.headerless_error_file {
            let mut guard = self.err_file.lock();
            if guard.is_none() {
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(f) => *guard = Some(f),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "cannot open headerless error file");
                    }
                }
            }
            if let Some(f) = guard.as_mut() {
                if f.write_all(msg.raw())
                    .and_then(|()| f.write_all(b"\n"))
                    .is_err()
                {
                    error!(path = %path.display(), "error writing headerless error file");
                    *guard = None;
                }
            }
        }

        debug!(
            hostname = msg.hostname().unwrap_or(""),
            tag = msg.tag().unwrap_or(""),
            "handled headerless message"
        );
        if self.cfg.headerless_drop {
            ParseResult::Discard
        } else {
            ParseResult::Parsed
        }
    }
}

impl Parser for Rfc3164Parser {
    fn name(&self) -> &'static str {
        "rfc3164"
    }

    fn parse(&self, msg: &mut Message) -> ParseResult {
        msg.set_protocol_version(0);
        if msg.facility() == FACILITY_INVALID {
            // Garbage PRI: take the record as-is, body starts after it.
            msg.set_msg_offset(msg.after_pri_offset());
            return ParseResult::Parsed;
        }

        let raw = msg.raw().to_vec();
        let len = raw.len();
        let mut pos = msg.after_pri_offset();

        // A record opening with whitespace followed by `{` or `[` is
        // structured payload without any header; no point trying.
        let mut probe = pos;
        while probe < len && (raw[probe] == b' ' || raw[probe] == b'\t') {
            probe += 1;
        }
        if probe < len && (raw[probe] == b'{' || raw[probe] == b'[') {
            if self.cfg.detect_headerless {
                return self.handle_headerless(msg, pos);
            }
            msg.set_msg_offset(pos);
            return ParseResult::Parsed;
        }

        // Timestamp detection, high precision first. The reported time
        // starts out as the reception time and is only replaced on a hit.
        let mut found_timestamp = false;
        if let Some(t) = datetime::parse_rfc3339(&raw, &mut pos) {
            msg.set_reported_time(t);
            found_timestamp = true;
        } else if let Some(t) =
            datetime::parse_rfc3164(&raw, &mut pos, self.cfg.detect_year_after_timestamp)
        {
            msg.set_reported_time(t);
            found_timestamp = true;
        } else if pos + 1 < len && raw[pos] == b' ' {
            // Slightly malformed: some devices send a leading space before
            // the timestamp.
            let mut retry = pos + 1;
            if let Some(t) =
                datetime::parse_rfc3164(&raw, &mut retry, self.cfg.detect_year_after_timestamp)
            {
                msg.set_reported_time(t);
                found_timestamp = true;
                pos = retry;
            }
        }

        if self.cfg.detect_headerless && !found_timestamp {
            // No PRI-adjacent timestamp in any supported form: strong
            // indication the record has no header at all.
            return self.handle_headerless(msg, pos);
        }

        if msg.has_flag(flags::IGNORE_DATE) {
            msg.set_reported_time(*msg.rcvd_time());
        }

        if !msg.has_flag(flags::INTERNAL) {
            // HOSTNAME, only for network-received records.
            if pos < len && msg.has_flag(flags::PARSE_HOSTNAME) {
                let mut i = pos;
                let mut had_bracket = false;
                if self.cfg.permit_square_brackets_in_hostname && raw[i] == b'[' {
                    had_bracket = true;
                    i += 1;
                }
                let host_start = i;
                while i < len
                    && i - pos < HOSTNAME_MAX
                    && (raw[i].is_ascii_alphanumeric()
                        || raw[i] == b'.'
                        || raw[i] == b'_'
                        || raw[i] == b'-'
                        || (raw[i] == b'@' && self.cfg.permit_at_signs_in_hostname)
                        || (raw[i] == b'/' && self.cfg.permit_slashes_in_hostname))
                {
                    i += 1;
                }

                if i == len && i > host_start {
                    // Record ends right after the hostname; still valid.
                    msg.set_hostname(String::from_utf8_lossy(&raw[pos..i]).into_owned());
                    pos = i;
                } else if i > host_start {
                    let mut is_hostname = false;
                    if had_bracket {
                        if i < len && raw[i] == b']' {
                            i += 1;
                            is_hostname = true;
                        }
                    } else if raw[i - 1].is_ascii_alphanumeric() {
                        is_hostname = true;
                    }
                    // A supposed hostname not followed by a space is most
                    // probably a tag.
                    if i >= len || raw[i] != b' ' {
                        is_hostname = false;
                    }
                    if is_hostname {
                        msg.set_hostname(String::from_utf8_lossy(&raw[pos..i]).into_owned());
                        pos = i + 1;
                    }
                }
            }

            // TAG: ended by `:` (part of the tag) or space (content).
            let tag_start = pos;
            let mut i = pos;
            while i < len && raw[i] != b':' && raw[i] != b' ' && i - tag_start < TAG_MAX {
                i += 1;
            }
            let tag = if i < len && raw[i] == b':' {
                i += 1;
                String::from_utf8_lossy(&raw[tag_start..i]).into_owned()
            } else if self.cfg.force_tag_ending_by_colon {
                // Not a tag, but message content; rewind and substitute the
                // nil tag.
                i = tag_start;
                "-".to_string()
            } else {
                String::from_utf8_lossy(&raw[tag_start..i]).into_owned()
            };
            msg.set_tag(tag);
            pos = i;
        }

        if self.cfg.remove_msg_first_space && pos < len && raw[pos] == b' ' {
            pos += 1;
        }
        msg.set_msg_offset(pos);
        ParseResult::Parsed
    }

    fn on_hup(&self) {
        // Drop the handle; the next headerless write reopens the file, so
        // rotation can move the old one away.
        let mut guard = self.err_file.lock();
        if guard.take().is_some() {
            debug!("closed headerless error file on HUP");
        }
    }
}
