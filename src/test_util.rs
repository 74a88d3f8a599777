//! Shared helpers for in-crate tests.

use std::path::Path;
use std::sync::{Arc, Mutex};

use weir_buffers::{QueueConfig, QueueKind};
use weir_core::MsgRef;

use crate::parsers::ParserChain;
use crate::ruleset::{Action, FilterConfig, OutputFn, Router, RuleSet};

/// A pass-through queue configuration: no buffering, consumer runs on the
/// producer thread, which keeps tests deterministic.
pub fn direct_queue() -> QueueConfig {
    QueueConfig {
        kind: QueueKind::Direct,
        max_size: 0,
        high_watermark: 0,
        low_watermark: 0,
        ..QueueConfig::default()
    }
}

/// A snapshot of the fields tests care about.
#[derive(Clone, Debug)]
pub struct SeenMessage {
    pub hostname: Option<String>,
    pub tag: Option<String>,
    pub body: String,
    pub input_name: Option<String>,
    pub severity: u8,
}

impl SeenMessage {
    fn of(msg: &MsgRef) -> Self {
        SeenMessage {
            hostname: msg.hostname().map(str::to_string),
            tag: msg.tag().map(str::to_string),
            body: String::from_utf8_lossy(msg.body()).into_owned(),
            input_name: msg.input_name().map(str::to_string),
            severity: msg.severity(),
        }
    }
}

/// A router with a single default rule set and one collect-everything
/// action, all on direct queues.
pub fn sink_router() -> (Arc<Router>, Arc<Mutex<Vec<SeenMessage>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let output: OutputFn = Arc::new(move |msg| {
        sink.lock().unwrap().push(SeenMessage::of(msg));
        Ok(())
    });
    let action = Action::new(
        "sink",
        FilterConfig::default(),
        &direct_queue(),
        Path::new("."),
        output,
    )
    .expect("building sink action");
    let ruleset = Arc::new(
        RuleSet::new(
            "default",
            ParserChain::default(),
            vec![action],
            &direct_queue(),
            Path::new("."),
        )
        .expect("building default ruleset"),
    );
    let router = Arc::new(Router::new(vec![ruleset], "default").expect("building router"));
    router.start().expect("starting router");
    (router, seen)
}
