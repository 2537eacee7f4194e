// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod connection;
pub mod device;
pub mod hypervisor;
pub mod mux;
pub mod notify;
pub mod peer;
pub mod region;
pub mod rendezvous;
pub mod store;

pub use postern;

use std::fmt;

/// A portable errno from the wire crate, as an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Errno(pub postern::Error);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match postern::errno::name(self.0) {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "errno {}", self.0),
        }
    }
}

impl std::error::Error for Errno {}
