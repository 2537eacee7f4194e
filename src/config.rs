// SPDX-License-Identifier: Apache-2.0

//! Connection configuration, read from a TOML file.

use crate::hypervisor::DomainId;
use crate::mux;
use crate::rendezvous::{Params, Role, DEFAULT_PAGES};
use crate::store::DEFAULT_ROOT;

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use postern::message::{HEADER_SIZE, MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Configuration file template
pub const CONFIG_TEMPLATE: &str = r#"## Configuration for a gatehouse connection

## Root of the rendezvous keys in the store
store-root = "/unikernel/random"

## Which half of the handshake this side runs: "offer" or "accept"
role = "accept"

## Pages in the shared region and the ring slot size (offering side only)
pages = 4
message-size = 2048

## Worker poll interval when no signal arrives
poll-interval-ms = 100

## Bound on a single call and on each handshake wait; unset waits forever
# response-timeout-ms = 5000
# handshake-timeout-ms = 30000

## Domain ids of the two ends of a loopback connection
offer-domain = 1
accept-domain = 2
"#;

/// Settings of one connection.
///
/// # Examples
///
/// ```
/// use gatehouse::config::Config;
///
/// let config: Config = toml::from_str(r#"
/// role = "offer"
/// pages = 8
/// "#).unwrap();
/// assert_eq!(config.pages, 8);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub store_root: String,
    pub role: Role,
    pub pages: usize,
    pub message_size: usize,
    pub poll_interval_ms: u64,
    pub response_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub offer_domain: DomainId,
    pub accept_domain: DomainId,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: DEFAULT_ROOT.into(),
            role: Role::default(),
            pages: DEFAULT_PAGES,
            message_size: MAX_MESSAGE_SIZE,
            poll_interval_ms: mux::DEFAULT_POLL.as_millis() as _,
            response_timeout_ms: None,
            handshake_timeout_ms: None,
            offer_domain: 1,
            accept_domain: 2,
        }
    }
}

impl Config {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.store_root.starts_with('/'),
            "store root {:?} is not absolute",
            self.store_root
        );
        ensure!(self.pages > 0, "the shared region needs at least one page");
        ensure!(
            (HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&self.message_size),
            "message size {} is outside of {HEADER_SIZE}..={MAX_MESSAGE_SIZE}",
            self.message_size
        );
        ensure!(self.poll_interval_ms > 0, "poll interval must not be zero");
        ensure!(
            self.offer_domain != 0 && self.accept_domain != 0,
            "domain id 0 is reserved"
        );
        ensure!(
            self.offer_domain != self.accept_domain,
            "both ends use domain {}",
            self.offer_domain
        );
        Ok(())
    }

    /// Handshake parameters.
    pub fn params(&self) -> Params {
        Params {
            pages: self.pages,
            message_size: self.message_size,
            timeout: self.handshake_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Worker poll interval.
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Multiplexer options.
    pub fn mux_options(&self) -> mux::Options {
        mux::Options {
            capacity: self.message_size - HEADER_SIZE,
            timeout: self.response_timeout_ms.map(Duration::from_millis),
            poll: self.poll(),
        }
    }
}
