// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use anyhow::anyhow;
use clap::{ArgAction, Args};

/// Logging options shared by every subcommand
#[derive(Args, Debug)]
pub struct LogOptions {
    /// Log more; repeat for more detail
    ///
    /// Errors only by default, then warnings, info, debug and trace.
    #[clap(long = "verbose", short = 'v', action = ArgAction::Count)]
    verbosity: u8,

    /// `env_logger` filter directives, e.g. `gatehouse::mux=debug`
    #[clap(long = "log-filter", env = "GATEHOUSE_LOG")]
    log_filter: Option<String>,

    /// Where log lines go: "stderr" or "stdout"
    #[clap(long, default_value = "stderr")]
    log_target: LogTarget,
}

impl LogOptions {
    /// Installs the process-wide logger. Must run once, before any logging.
    pub fn init(&self) {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(self.verbosity_level())
            .parse_filters(self.log_filter.as_deref().unwrap_or_default())
            .target(self.log_target.into())
            .init();
    }

    fn verbosity_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LogTarget {
    Stdout,
    Stderr,
}

impl FromStr for LogTarget {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(anyhow!("unknown log target {:?}", s)),
        }
    }
}

impl From<LogTarget> for env_logger::Target {
    fn from(t: LogTarget) -> Self {
        match t {
            LogTarget::Stdout => Self::Stdout,
            LogTarget::Stderr => Self::Stderr,
        }
    }
}
