//! Rule sets, filters, and action submission.
//!
//! A rule set binds a parser chain to an ordered list of actions. Parsed
//! messages land on the rule set's own queue; its consumer fans each
//! message out to every action whose filter matches, by handing a
//! reference-counted clone to the action's queue. Each action queue is an
//! independent queue with its own workers, watermarks, and (optionally)
//! disk assistance.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use weir_buffers::config::ConfigError;
use weir_buffers::{Consumer, ConsumerError, Queue, QueueConfig};
use weir_core::{Message, MsgRef};

use crate::internal_events::emit_submit_failure;
use crate::parsers::{ParseResult, ParserChain};

#[derive(Debug, Snafu)]
pub enum RulesetError {
    #[snafu(display("could not build queue for {name}: {source}"))]
    BuildQueue { name: String, source: ConfigError },
    #[snafu(display("could not start queue for {name}: {source}"))]
    StartQueue {
        name: String,
        source: weir_buffers::QueueError,
    },
    #[snafu(display("unknown ruleset: {name}"))]
    UnknownRuleset { name: String },
}

/// Message predicate deciding whether an action sees a message.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FilterConfig {
    /// Lowest severity number accepted (0 = emerg).
    pub min_severity: Option<u8>,
    /// Highest severity number accepted (7 = debug).
    pub max_severity: Option<u8>,
    /// Accepted facility numbers; empty means all.
    pub facilities: Vec<u8>,
    /// Exact program-name match.
    pub program: Option<String>,
}

impl FilterConfig {
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(min) = self.min_severity {
            if msg.severity() < min {
                return false;
            }
        }
        if let Some(max) = self.max_severity {
            if msg.severity() > max {
                return false;
            }
        }
        if !self.facilities.is_empty() && !self.facilities.contains(&msg.facility()) {
            return false;
        }
        if let Some(program) = &self.program {
            if msg.program_name() != *program {
                return false;
            }
        }
        true
    }
}

/// The delivery callback of an action; failures are logged by the queue
/// and the message counts as delivered.
pub type OutputFn = Arc<dyn Fn(&MsgRef) -> Result<(), ConsumerError> + Send + Sync>;

/// One output binding: filter plus an independently queued delivery path.
pub struct Action {
    name: String,
    filter: FilterConfig,
    queue: Queue<MsgRef>,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        filter: FilterConfig,
        queue_config: &QueueConfig,
        dir: &Path,
        output: OutputFn,
    ) -> Result<Self, RulesetError> {
        let name = name.into();
        let consumer: Consumer<MsgRef> = {
            let output = Arc::clone(&output);
            Arc::new(move |msg: MsgRef| output(&msg))
        };
        let queue = queue_config
            .build(format!("action-{name}"), dir, consumer)
            .with_context(|_| BuildQueueSnafu { name: name.clone() })?;
        Ok(Action {
            name,
            filter,
            queue,
        })
    }

    fn start(&self) -> Result<(), RulesetError> {
        self.queue
            .start()
            .with_context(|_| StartQueueSnafu {
                name: self.name.clone(),
            })
    }

    /// Hands the action its own reference to the message.
    fn submit(&self, msg: &MsgRef) {
        if !self.filter.matches(msg) {
            return;
        }
        if let Err(e) = self.queue.enqueue(msg.clone()) {
            emit_submit_failure(&self.name);
            debug!(action = %self.name, error = %e, "action queue rejected message");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Queue<MsgRef> {
        &self.queue
    }
}

/// A named parser-chain-plus-actions binding with its own buffering queue.
pub struct RuleSet {
    name: String,
    chain: ParserChain,
    actions: Arc<Vec<Action>>,
    queue: Queue<MsgRef>,
}

impl RuleSet {
    pub fn new(
        name: impl Into<String>,
        chain: ParserChain,
        actions: Vec<Action>,
        queue_config: &QueueConfig,
        dir: &Path,
    ) -> Result<Self, RulesetError> {
        let name = name.into();
        let actions = Arc::new(actions);
        let consumer: Consumer<MsgRef> = {
            let actions = Arc::clone(&actions);
            Arc::new(move |msg: MsgRef| {
                for action in actions.iter() {
                    action.submit(&msg);
                }
                Ok(())
            })
        };
        let queue = queue_config
            .build(format!("ruleset-{name}"), dir, consumer)
            .with_context(|_| BuildQueueSnafu { name: name.clone() })?;
        Ok(RuleSet {
            name,
            chain,
            actions,
            queue,
        })
    }

    pub fn start(&self) -> Result<(), RulesetError> {
        for action in self.actions.iter() {
            action.start()?;
        }
        self.queue
            .start()
            .with_context(|_| StartQueueSnafu {
                name: self.name.clone(),
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Queue<MsgRef> {
        &self.queue
    }
}

/// Routes parsed messages to their rule set.
pub struct Router {
    rulesets: HashMap<String, Arc<RuleSet>>,
    default_ruleset: Arc<RuleSet>,
}

impl Router {
    pub fn new(
        rulesets: Vec<Arc<RuleSet>>,
        default_name: &str,
    ) -> Result<Self, RulesetError> {
        let map: HashMap<String, Arc<RuleSet>> = rulesets
            .into_iter()
            .map(|rs| (rs.name.clone(), rs))
            .collect();
        let default_ruleset = map
            .get(default_name)
            .cloned()
            .ok_or_else(|| RulesetError::UnknownRuleset {
                name: default_name.to_string(),
            })?;
        Ok(Router {
            rulesets: map,
            default_ruleset,
        })
    }

    pub fn start(&self) -> Result<(), RulesetError> {
        for rs in self.rulesets.values() {
            rs.start()?;
        }
        Ok(())
    }

    fn lookup(&self, name: Option<&str>) -> &Arc<RuleSet> {
        name.and_then(|n| self.rulesets.get(n))
            .unwrap_or(&self.default_ruleset)
    }

    /// Full ingestion path for one raw message: parse with the bound rule
    /// set's chain, honor any rule set the parser assigned, enqueue.
    pub fn route(&self, mut msg: Message, binding: Option<&str>) {
        let ruleset = self.lookup(binding);
        if ruleset.chain.parse(&mut msg) == ParseResult::Discard {
            trace!(ruleset = %ruleset.name, "parser discarded message");
            return;
        }
        // A parser may have re-bound the message (e.g. headerless
        // routing).
        let target = match msg.ruleset() {
            Some(assigned) if assigned != ruleset.name => {
                self.rulesets.get(assigned).unwrap_or(ruleset)
            }
            _ => ruleset,
        };
        if let Err(e) = target.queue.enqueue(MsgRef::new(msg)) {
            emit_submit_failure(&target.name);
            debug!(ruleset = %target.name, error = %e, "ruleset queue rejected message");
        }
    }

    pub fn on_hup(&self) {
        for rs in self.rulesets.values() {
            rs.chain.on_hup();
        }
    }

    /// Orderly teardown: rule set queues first (so they stop feeding
    /// actions), then every action queue.
    pub fn shutdown(&self) {
        for rs in self.rulesets.values() {
            rs.queue.stop();
        }
        for rs in self.rulesets.values() {
            for action in rs.actions.iter() {
                action.queue.stop();
            }
        }
    }
}
