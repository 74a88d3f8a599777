#[macro_use]
extern crate tracing;

mod app;
mod config;
mod internal_events;
mod outputs;
mod parsers;
mod ruleset;
mod sources;
mod strgen;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "weir", about = "A syslog processing daemon with disk-assisted queueing")]
struct Opts {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/weir/weir.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let config = match DaemonConfig::load(&opts.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::FAILURE;
        }
    };
    if opts.check {
        info!(path = %opts.config.display(), "configuration is valid");
        return ExitCode::SUCCESS;
    }

    let app = match app::build(&config) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    match app.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "runtime failure");
            ExitCode::FAILURE
        }
    }
}
