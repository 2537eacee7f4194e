// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::io::prelude::*;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Args;
use gatehouse::config::CONFIG_TEMPLATE;

/// Generate a `Gatehouse.toml` template
#[derive(Args, Debug)]
pub struct Options {
    /// Where to write the template
    #[clap(default_value = "Gatehouse.toml")]
    path: PathBuf,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        if self.path.exists() {
            bail!("{:?} does already exist.", self.path);
        }

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("failed to create {:?}", self.path))?;

        file.write_all(CONFIG_TEMPLATE.as_bytes())?;
        Ok(())
    }
}
