//! Daemon assembly and lifecycle.

use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use snafu::{ResultExt, Snafu};

use crate::config::{DaemonConfig, SourceConfig};
use crate::outputs;
use crate::parsers::{self, ParserChain};
use crate::ruleset::{Action, Router, RuleSet};
use crate::sources::{dtls, udp, unix, SourceHandle};

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("could not create workdir: {source}"))]
    Workdir { source: std::io::Error },
    #[snafu(context(false))]
    Parser {
        source: parsers::ParserBuildError,
    },
    #[snafu(context(false))]
    Output {
        source: outputs::OutputBuildError,
    },
    #[snafu(context(false))]
    Ruleset {
        source: crate::ruleset::RulesetError,
    },
    #[snafu(display("source {name} failed: {message}"))]
    Source { name: String, message: String },
    #[snafu(display("could not install signal handlers: {source}"))]
    Signals { source: std::io::Error },
}

pub struct App {
    router: Arc<Router>,
    sources: Vec<SourceHandle>,
}

/// Builds rule sets, actions, and the router, starts every queue, then
/// brings the listeners up.
pub fn build(config: &DaemonConfig) -> Result<App, AppError> {
    std::fs::create_dir_all(&config.workdir).context(WorkdirSnafu)?;

    let mut rulesets = Vec::new();
    for (name, rs_config) in &config.rulesets {
        let chain = if rs_config.parsers.is_empty() {
            ParserChain::default()
        } else {
            let mut bound = Vec::new();
            for binding in &rs_config.parsers {
                bound.push(parsers::build_parser(
                    &binding.name,
                    Some(&binding.params),
                )?);
            }
            ParserChain::new(bound)
        };

        let mut actions = Vec::new();
        for action_config in &rs_config.actions {
            let output = outputs::build_output(
                &action_config.name,
                &action_config.kind,
                action_config.path.as_deref(),
            )?;
            actions.push(Action::new(
                &action_config.name,
                action_config.filter.clone(),
                &action_config.queue,
                &config.workdir,
                output,
            )?);
        }

        rulesets.push(Arc::new(RuleSet::new(
            name,
            chain,
            actions,
            &rs_config.queue,
            &config.workdir,
        )?));
    }

    let router = Arc::new(Router::new(rulesets, &config.default_ruleset)?);
    router.start()?;

    let mut sources = Vec::new();
    for (name, source_config) in &config.sources {
        let handle = match source_config {
            SourceConfig::Udp(c) => {
                udp::spawn(c.clone(), Arc::clone(&router)).map_err(|e| AppError::Source {
                    name: name.clone(),
                    message: e.to_string(),
                })?
            }
            SourceConfig::Unix(c) => {
                unix::spawn(c.clone(), Arc::clone(&router)).map_err(|e| AppError::Source {
                    name: name.clone(),
                    message: e.to_string(),
                })?
            }
            SourceConfig::Dtls(c) => {
                dtls::spawn(c.clone(), Arc::clone(&router)).map_err(|e| AppError::Source {
                    name: name.clone(),
                    message: e.to_string(),
                })?
            }
        };
        info!(source = %name, "source started");
        sources.push(handle);
    }

    Ok(App { router, sources })
}

impl App {
    /// Blocks until SIGTERM/SIGINT, reacting to SIGHUP by reopening
    /// rotated files (currently: parser error files).
    pub fn run(mut self) -> Result<(), AppError> {
        let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT]).context(SignalsSnafu)?;
        info!("weir is up");
        for signal in signals.forever() {
            match signal {
                SIGHUP => {
                    info!("received SIGHUP, reopening files");
                    self.router.on_hup();
                }
                SIGTERM | SIGINT => {
                    info!("received termination signal, shutting down");
                    break;
                }
                _ => {}
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Orderly teardown: listeners first so nothing new arrives, then the
    /// queues (which drain or persist per their policy).
    pub fn shutdown(&mut self) {
        for source in &mut self.sources {
            source.stop();
        }
        self.router.shutdown();
        info!("weir stopped");
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}
