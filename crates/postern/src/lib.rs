// SPDX-License-Identifier: Apache-2.0

//! Wire format for the inter-VM socket transport
//!
//! `postern` defines everything two virtual machines have to agree on byte-for-byte in order to
//! proxy socket calls from a protected VM (PVM) to an isolated network stack VM (INS) through a
//! region of granted pages. A [postern](https://en.wikipedia.org/wiki/Postern) is the small
//! back gate in a fortification wall.
//!
//! # Mechanism of action
//!
//! The granted region holds a single [ring](ring) of fixed-size slots. The front end writes a
//! request into the next free slot and publishes it by advancing the shared request producer
//! cursor. The back end consumes the request, executes it, and writes the response into the same
//! slot before advancing the response producer cursor. A request and its response are matched by
//! their correlation id, never by position.
//!
//! # Message format
//!
//! Every [message](message) starts with a 32-byte little-endian [header](message::Header):
//!
//! * signature: `u16` - `0xff11` for requests, `0xff33` for responses
//! * kind: `u16` - the [operation](message::Op), with `0x8000` set on responses
//! * size: `u32` - header plus payload in bytes
//! * id: `u64` - correlation id, `0` is never issued
//! * handle: `i32` - socket handle the call refers to
//! * status: `u32` - response status, see [`Status`](message::Status)
//! * flags: `u32` - see [`Flags`](message::Flags)
//! * reserved: `u32`
//!
//! The payload follows the header immediately and is bounded by [`message::MAX_MESSAGE_SIZE`].
//! Typed payloads for every socket verb live in [`message::payload`].
//!
//! # Ring format
//!
//! The region starts with a 64-byte [header](ring::Header) followed by a power-of-two number of
//! slots. See [`ring`] for the cursor protocol.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod errno;
pub mod message;
pub mod ring;

/// Error type used within this crate, a portable [errno](errno) value.
pub type Error = i32;

/// Result type returned by functionality exposed by this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// The postern version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
