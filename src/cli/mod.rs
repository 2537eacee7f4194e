// SPDX-License-Identifier: Apache-2.0

mod config;
mod demo;
mod log;

use self::log::LogOptions;

use clap::{Parser, Subcommand};

/// Socket RPC between virtual machines over a shared-memory ring
///
/// Gatehouse connects two domains through a rendezvous store, a granted
/// region and an event channel, and multiplexes socket requests of many
/// callers over the ring between them.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Options {
    /// Logging options
    #[clap(flatten)]
    logger: LogOptions,

    /// Subcommands (with their own options)
    #[clap(subcommand)]
    cmd: Subcommands,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        self.logger.init();

        ::log::info!("logging initialized!");
        ::log::info!("CLI opts: {:?}", self);

        self.cmd.dispatch()
    }
}

/// `gatehouse` subcommands and their options/arguments.
#[derive(Subcommand, Debug)]
enum Subcommands {
    Demo(demo::Options),
    #[clap(subcommand)]
    Config(config::Subcommands),
}

impl Subcommands {
    fn dispatch(self) -> anyhow::Result<()> {
        match self {
            Self::Demo(cmd) => cmd.execute(),
            Self::Config(subcmd) => subcmd.dispatch(),
        }
    }
}
