//! The parser chain.
//!
//! Parsers turn a raw record into structured message fields. They are tried
//! in the order the rule set binds them; a parser that cannot handle a
//! record returns [`ParseResult::CouldNotParse`] and the chain moves on.
//! Transform-only parsers rewrite the raw buffer into a normal form and
//! *still* return `CouldNotParse`, so a later parser handles the normalized
//! record.

pub mod aixforwardedfrom;
pub mod cisconames;
pub mod db2diag;
pub mod dummy;
pub mod lastmsg;
pub mod rfc3164;
pub mod rfc3164sd;
pub mod snare;

use serde::de::DeserializeOwned;
use snafu::Snafu;
use std::sync::Arc;

use weir_core::pri;
use weir_core::Message;

use crate::internal_events::emit_parse_failure;

/// Chain services a parser can take over itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserFeature {
    /// The parser copes with unsanitized records.
    AutomaticSanitization,
    /// The parser expects the PRI to be split off before it runs.
    AutomaticPriParsing,
}

/// Outcome of one parser's attempt at a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// The record is parsed; the chain stops.
    Parsed,
    /// Not this parser's format; the chain tries the next one.
    CouldNotParse,
    /// The parser decided the record must be dropped entirely.
    Discard,
}

#[derive(Debug, Snafu)]
pub enum ParserBuildError {
    #[snafu(display("unknown parser: {name}"))]
    UnknownParser { name: String },
    #[snafu(display("invalid parameters for parser {name}: {source}"))]
    BadParams {
        name: String,
        source: toml::de::Error,
    },
}

/// One parser module instance, bound into a chain.
pub trait Parser: Send + Sync {
    /// The advertised parser name the configuration binds by.
    fn name(&self) -> &'static str;

    fn is_compatible_with(&self, feature: ParserFeature) -> bool {
        matches!(
            feature,
            ParserFeature::AutomaticSanitization | ParserFeature::AutomaticPriParsing
        )
    }

    /// Attempts to parse `msg`. May mutate the message (move offsets, set
    /// fields); on `CouldNotParse` the scalar fields must be left as they
    /// were on entry, except for documented transform-only buffer
    /// rewrites.
    fn parse(&self, msg: &mut Message) -> ParseResult;

    /// Reopen any rotated files. Called on SIGHUP.
    fn on_hup(&self) {}
}

fn params_from<C: DeserializeOwned + Default>(
    name: &str,
    params: Option<&toml::Table>,
) -> Result<C, ParserBuildError> {
    match params {
        None => Ok(C::default()),
        Some(table) => {
            table
                .clone()
                .try_into()
                .map_err(|source| ParserBuildError::BadParams {
                    name: name.to_string(),
                    source,
                })
        }
    }
}

/// Instantiates a parser by its advertised name.
pub fn build_parser(
    name: &str,
    params: Option<&toml::Table>,
) -> Result<Arc<dyn Parser>, ParserBuildError> {
    Ok(match name {
        "rfc3164" => Arc::new(rfc3164::Rfc3164Parser::new(params_from(name, params)?)),
        "rfc3164sd" => Arc::new(rfc3164sd::Rfc3164SdParser),
        "db2diag" => Arc::new(db2diag::Db2DiagParser::new(params_from(name, params)?)),
        "lastmsg" => Arc::new(lastmsg::LastMsgParser),
        "cisconames" => Arc::new(cisconames::CiscoNamesParser),
        "aixforwardedfrom" => Arc::new(aixforwardedfrom::AixForwardedFromParser),
        "snare" => Arc::new(snare::SnareParser),
        "dummy" => Arc::new(dummy::DummyParser),
        other => {
            return Err(ParserBuildError::UnknownParser {
                name: other.to_string(),
            })
        }
    })
}

/// An ordered chain of parsers bound to a rule set.
#[derive(Clone)]
pub struct ParserChain {
    parsers: Vec<Arc<dyn Parser>>,
}

impl Default for ParserChain {
    /// The default chain: the legacy-syslog parser with default options.
    fn default() -> Self {
        ParserChain {
            parsers: vec![Arc::new(rfc3164::Rfc3164Parser::new(
                rfc3164::Rfc3164Config::default(),
            ))],
        }
    }
}

impl ParserChain {
    pub fn new(parsers: Vec<Arc<dyn Parser>>) -> Self {
        ParserChain { parsers }
    }

    /// Strips line terminators and NULs the wire tends to append.
    fn sanitize(msg: &mut Message) {
        msg.with_raw_mut(|raw| {
            while matches!(raw.last(), Some(b'\n' | b'\r' | 0)) {
                raw.pop();
            }
        });
    }

    /// Runs the full ingestion parse: sanitize, split the PRI, then walk
    /// the chain. A message no parser claims keeps whatever state the last
    /// parser left; delivery is downstream's decision.
    pub fn parse(&self, msg: &mut Message) -> ParseResult {
        Self::sanitize(msg);
        let pri = pri::parse_pri(msg.raw());
        msg.apply_pri(pri);

        for parser in &self.parsers {
            match parser.parse(msg) {
                ParseResult::Parsed => return ParseResult::Parsed,
                ParseResult::Discard => return ParseResult::Discard,
                ParseResult::CouldNotParse => {
                    trace!(parser = parser.name(), "parser passed on message");
                }
            }
        }
        emit_parse_failure(msg.input_name().unwrap_or("unknown"));
        debug!("no parser in chain claimed the message");
        ParseResult::CouldNotParse
    }

    pub fn on_hup(&self) {
        for parser in &self.parsers {
            parser.on_hup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_falls_through_transform_parsers() {
        // A Cisco-mangled record: the transform parser rewrites it and
        // passes, then the legacy parser picks up the normal form.
        let chain = ParserChain::new(vec![
            Arc::new(cisconames::CiscoNamesParser),
            Arc::new(rfc3164::Rfc3164Parser::new(Default::default())),
        ]);
        let mut msg = Message::new();
        msg.set_raw(b"<189>Oct 11 22:14:15 firewall : %ASA-6-302013: Built outbound");
        msg.add_flags(weir_core::message::flags::PARSE_HOSTNAME);
        let result = chain.parse(&mut msg);
        assert_eq!(result, ParseResult::Parsed);
        assert_eq!(msg.hostname(), Some("firewall"));
        assert_eq!(msg.tag(), Some("%ASA-6-302013:"));
    }

    #[test]
    fn sanitize_strips_trailing_terminators() {
        let chain = ParserChain::default();
        let mut msg = Message::new();
        msg.set_raw(b"<13>Oct 11 22:14:15 host tag: body\r\n\0");
        chain.parse(&mut msg);
        assert!(!msg.raw().ends_with(b"\0"));
        assert!(msg.body().ends_with(b"body"));
    }

    #[test]
    fn unknown_parser_name_is_rejected() {
        assert!(build_parser("no-such-parser", None).is_err());
    }
}
