// SPDX-License-Identifier: Apache-2.0

//! Local device interface
//!
//! A [`Device`] is the byte-stream view of a connection for one caller:
//! writing an encoded request submits it and reading returns the encoded
//! response. The [`Handles`] set answers whether a socket handle lives on
//! the other side of the connection.

use crate::connection::Connection;
use crate::mux::{self, Caller};

use std::collections::HashSet;
use std::io;
use std::sync::{PoisonError, RwLock};

use postern::errno::EMSGSIZE;
use postern::message::{Flags, Message, Status};

/// Socket handles created through one connection.
#[derive(Debug, Default)]
pub struct Handles(RwLock<HashSet<i32>>);

impl Handles {
    pub fn contains(&self, handle: i32) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handle)
    }

    /// Learns from a request about to be sent.
    pub fn track_request(&self, request: &Message) {
        if matches!(request.header.op(), Ok(op) if op.releases_handle()) {
            self.0
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request.header.handle);
        }
    }

    /// Learns from a response that arrived.
    pub fn track_response(&self, response: &Message) {
        let allocated = matches!(response.header.op(), Ok(op) if op.allocates_handle());
        if allocated && response.header.status == Status::SUCCESS && response.header.handle >= 0 {
            self.0
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(response.header.handle);
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn os_error(e: mux::Error) -> io::Error {
    io::Error::from_raw_os_error(e.errno())
}

/// One caller's duplex handle on a [`Connection`].
///
/// Not shared between threads: a caller owns at most one request in flight.
#[derive(Debug)]
pub struct Device<'a> {
    conn: &'a Connection,
    caller: Caller,
    response: Option<Vec<u8>>,
}

impl<'a> Device<'a> {
    /// Opens a device for the calling thread.
    pub fn open(conn: &'a Connection) -> Self {
        Self::open_as(conn, Caller::current())
    }

    pub fn open_as(conn: &'a Connection, caller: Caller) -> Self {
        Self {
            conn,
            caller,
            response: None,
        }
    }

    #[inline]
    pub fn caller(&self) -> Caller {
        self.caller
    }

    /// Is `handle` one of this connection's sockets?
    pub fn is_ours(&self, handle: i32) -> bool {
        self.conn.is_ours(handle)
    }

    /// Bytes of the response waiting to be read.
    pub fn pending(&self) -> usize {
        self.response.as_ref().map_or(0, Vec::len)
    }
}

impl io::Write for Device<'_> {
    /// Submits one encoded request.
    ///
    /// Blocks for the response if the request carries
    /// `CALLER_AWAITS_RESPONSE`, which makes it available to `read`. A
    /// response cut to the capacity reads back flagged `TRUNCATED` with an
    /// `EMSGSIZE` status.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let request = Message::decode(buf).map_err(io::Error::from_raw_os_error)?;
        let len = request.encoded_len();

        if !request.header.flags.contains(Flags::CALLER_AWAITS_RESPONSE) {
            self.conn.submit(request).map_err(os_error)?;
            return Ok(len);
        }

        if self.response.is_some() {
            return Err(os_error(mux::Error::Busy));
        }

        let response = match self.conn.call_as(self.caller, request) {
            Ok(response) => response,
            Err(mux::Error::Truncated(mut response)) => {
                // The encoded size only covers what was kept.
                response.header.status = Status::from_errno(EMSGSIZE);
                response
            }
            Err(e) => return Err(os_error(e)),
        };

        self.response = Some(response.to_bytes());
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Device<'_> {
    /// Copies out the pending response; `Ok(0)` if there is none.
    ///
    /// A buffer too small for the whole response fails with `EMSGSIZE` and
    /// leaves it pending.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(response) = self.response.take() else {
            return Ok(0);
        };

        if response.len() > buf.len() {
            self.response = Some(response);
            return Err(io::Error::from_raw_os_error(EMSGSIZE));
        }

        buf[..response.len()].copy_from_slice(&response);
        Ok(response.len())
    }
}

impl Drop for Device<'_> {
    fn drop(&mut self) {
        self.conn.release_caller(self.caller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postern::errno::EINVAL;
    use postern::message::{Header, Op};

    fn response(op: Op, handle: i32, status: Status) -> Message {
        let request = Header::request(op, handle, 0);
        Message::failure(&request, status)
    }

    #[test]
    fn handles_follow_create_accept_close() {
        let handles = Handles::default();

        handles.track_response(&response(Op::Create, 3, Status::SUCCESS));
        handles.track_response(&response(Op::Accept, 4, Status::SUCCESS));
        assert!(handles.contains(3) && handles.contains(4));

        // Failures and verbs that do not allocate leave the set alone.
        handles.track_response(&response(Op::Create, 5, Status::from_errno(EINVAL)));
        handles.track_response(&response(Op::Connect, 6, Status::SUCCESS));
        assert_eq!(handles.len(), 2);

        handles.track_request(&Message::request(Op::Close, 3, vec![]).unwrap());
        assert!(!handles.contains(3));
        handles.track_request(&Message::request(Op::Send, 4, vec![]).unwrap());
        assert!(handles.contains(4));
    }
}
