// SPDX-License-Identifier: Apache-2.0

//! Request and response messages.

pub mod payload;

use crate::errno::{EBADMSG, EINVAL, EMSGSIZE};
use crate::{Error, Result};

use bitflags::bitflags;
use core::convert::TryFrom;
use core::fmt;

/// Size of the encoded [`Header`].
pub const HEADER_SIZE: usize = 32;

/// Largest encoded message, header included. One message fills at most one ring slot.
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// Largest payload that fits behind a [`Header`].
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// Correlation id value that is never issued.
pub const UNSET_ID: u64 = 0;

/// Socket handle value meaning "no socket".
pub const INVALID_HANDLE: i32 = -1;

/// Set in [`Header::kind`] on responses.
pub const RESPONSE_BIT: u16 = 0x8000;

/// Masks the [`Op`] out of [`Header::kind`].
pub const OP_MASK: u16 = 0x7fff;

/// Message signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Signature {
    Request = 0xff11,
    Response = 0xff33,
}

impl TryFrom<u16> for Signature {
    type Error = Error;

    #[inline]
    fn try_from(sig: u16) -> Result<Self> {
        match sig {
            sig if sig == Signature::Request as _ => Ok(Signature::Request),
            sig if sig == Signature::Response as _ => Ok(Signature::Response),
            _ => Err(EBADMSG),
        }
    }
}

/// The op allocates a socket handle on success.
pub const ALLOC_HANDLE: u16 = 0x0100;

/// The op releases its socket handle.
pub const DEALLOC_HANDLE: u16 = 0x0200;

/// A close on the handle must wait for this op to complete.
pub const CLOSE_WAITS: u16 = 0x0400;

/// Socket verb carried by a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Op {
    Invalid = 0x00,

    Create = 0x01 | ALLOC_HANDLE,
    Shutdown = 0x02,
    Close = 0x03 | DEALLOC_HANDLE,

    Connect = 0x10,
    Bind = 0x11,
    Listen = 0x12,
    Accept = 0x13 | ALLOC_HANDLE,

    Send = 0x20 | CLOSE_WAITS,
    Recv = 0x21,
    RecvFrom = 0x22,

    GetName = 0x30 | CLOSE_WAITS,
    GetPeer = 0x31 | CLOSE_WAITS,
    Attrib = 0x32,
    PollsetQuery = 0x33,

    /// Diagnostic verb: the back end returns the payload unchanged.
    Echo = 0x7f,
}

impl Op {
    /// Does a successful response to this op carry a new socket handle?
    #[inline]
    pub const fn allocates_handle(self) -> bool {
        self as u16 & ALLOC_HANDLE != 0
    }

    /// Does this op give up its socket handle?
    #[inline]
    pub const fn releases_handle(self) -> bool {
        self as u16 & DEALLOC_HANDLE != 0
    }

    /// Must a close of the same handle wait for this op?
    #[inline]
    pub const fn close_waits(self) -> bool {
        self as u16 & CLOSE_WAITS != 0
    }
}

impl TryFrom<u16> for Op {
    type Error = Error;

    fn try_from(op: u16) -> Result<Self> {
        const OPS: [Op; 16] = [
            Op::Invalid,
            Op::Create,
            Op::Shutdown,
            Op::Close,
            Op::Connect,
            Op::Bind,
            Op::Listen,
            Op::Accept,
            Op::Send,
            Op::Recv,
            Op::RecvFrom,
            Op::GetName,
            Op::GetPeer,
            Op::Attrib,
            Op::PollsetQuery,
            Op::Echo,
        ];

        OPS.into_iter().find(|o| *o as u16 == op).ok_or(EINVAL)
    }
}

bitflags! {
    /// Message flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        /// The caller blocks until the response arrives.
        const CALLER_AWAITS_RESPONSE = 0x0000_0001;
        /// The response did not fit the caller's buffer and was cut short.
        const TRUNCATED = 0x0800_0000;
        /// Last chunk of a batched send.
        const BATCH_SEND_FINI = 0x1000_0000;
        /// Middle chunk of a batched send.
        const BATCH_SEND = 0x2000_0000;
        /// First chunk of a batched send.
        const BATCH_SEND_INIT = 0x4000_0000;
        /// The remote side of the connection closed.
        const REMOTE_CLOSED = 0x8000_0000;
    }
}

const CRITICAL_PREFIX: u32 = 0xc0;
const CRITICAL_SHIFT: u32 = 24;

/// Response status.
///
/// `0` is success, any other value below the critical range is a portable
/// [errno](crate::errno). A critical status means the channel itself is unusable.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    /// The call succeeded.
    pub const SUCCESS: Self = Self(0);

    /// The peer failed internally while handling the call.
    pub const INTERNAL_ERROR: Self = Self::critical(1);

    /// The channel broke down before a response could be delivered.
    pub const CHANNEL_DEAD: Self = Self::critical(2);

    /// Builds a critical status.
    #[inline]
    pub const fn critical(code: u32) -> Self {
        Self((CRITICAL_PREFIX << CRITICAL_SHIFT) | code)
    }

    /// Builds a status carrying a portable errno.
    #[inline]
    pub const fn from_errno(errno: Error) -> Self {
        Self(errno.unsigned_abs())
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_critical(self) -> bool {
        self.0 >> CRITICAL_SHIFT == CRITICAL_PREFIX
    }

    /// The errno carried by a non-critical failure.
    pub const fn errno(self) -> Option<Error> {
        if self.is_success() || self.is_critical() || self.0 > i32::MAX as u32 {
            None
        } else {
            Some(self.0 as Error)
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            f.write_str("Status::SUCCESS")
        } else if self.is_critical() {
            write!(f, "Status::critical({:#x})", self.0 & 0x00ff_ffff)
        } else {
            match self.errno().and_then(crate::errno::name) {
                Some(name) => write!(f, "Status({name})"),
                None => write!(f, "Status({:#x})", self.0),
            }
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Message header.
///
/// The signature and kind are kept raw so that a corrupt message can still be
/// decoded and reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub signature: u16,
    pub kind: u16,
    pub size: u32,
    pub id: u64,
    pub handle: i32,
    pub status: Status,
    pub flags: Flags,
}

impl Header {
    /// Header of a request with `len` bytes of payload.
    pub fn request(op: Op, handle: i32, len: usize) -> Self {
        Self {
            signature: Signature::Request as _,
            kind: op as _,
            size: (HEADER_SIZE + len) as _,
            id: UNSET_ID,
            handle,
            status: Status::SUCCESS,
            flags: Flags::CALLER_AWAITS_RESPONSE,
        }
    }

    /// Header of the response to `request` with `len` bytes of payload.
    pub fn response(request: &Header, status: Status, len: usize) -> Self {
        Self {
            signature: Signature::Response as _,
            kind: request.kind | RESPONSE_BIT,
            size: (HEADER_SIZE + len) as _,
            id: request.id,
            handle: request.handle,
            status,
            flags: Flags::empty(),
        }
    }

    /// The decoded signature.
    #[inline]
    pub fn signature(&self) -> Result<Signature> {
        self.signature.try_into()
    }

    /// The op with the response bit masked off.
    #[inline]
    pub fn op(&self) -> Result<Op> {
        (self.kind & OP_MASK).try_into()
    }

    /// Payload bytes following the header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    fn sized(&self) -> bool {
        (HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&(self.size as usize))
    }

    /// Well-formed request: request signature, response bit clear, sane size.
    pub fn is_request(&self) -> bool {
        self.signature() == Ok(Signature::Request) && self.kind & RESPONSE_BIT == 0 && self.sized()
    }

    /// Well-formed response: response signature, response bit set, sane size.
    pub fn is_response(&self) -> bool {
        self.signature() == Ok(Signature::Response) && self.kind & RESPONSE_BIT != 0 && self.sized()
    }

    /// Serializes into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        let out = out.get_mut(..HEADER_SIZE).ok_or(EMSGSIZE)?;
        out[0..2].copy_from_slice(&self.signature.to_le_bytes());
        out[2..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&self.id.to_le_bytes());
        out[16..20].copy_from_slice(&self.handle.to_le_bytes());
        out[20..24].copy_from_slice(&self.status.0.to_le_bytes());
        out[24..28].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[28..32].fill(0);
        Ok(())
    }

    /// Deserializes from the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let b = bytes.get(..HEADER_SIZE).ok_or(EBADMSG)?;
        let u16_at = |o: usize| u16::from_le_bytes([b[o], b[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);

        let mut id = [0u8; 8];
        id.copy_from_slice(&b[8..16]);

        Ok(Self {
            signature: u16_at(0),
            kind: u16_at(2),
            size: u32_at(4),
            id: u64::from_le_bytes(id),
            handle: u32_at(16) as i32,
            status: Status(u32_at(20)),
            flags: Flags::from_bits_retain(u32_at(24)),
        })
    }
}

/// A header and its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a request. Fails with `EMSGSIZE` if the payload cannot fit a slot.
    pub fn request(op: Op, handle: i32, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EMSGSIZE);
        }

        Ok(Self {
            header: Header::request(op, handle, payload.len()),
            payload,
        })
    }

    /// Builds a request from a typed payload.
    pub fn request_with(op: Op, handle: i32, payload: &impl payload::Payload) -> Result<Self> {
        let mut bytes = Vec::new();
        payload.encode(&mut bytes);
        Self::request(op, handle, bytes)
    }

    /// Builds the response to `request`.
    pub fn response(request: &Header, status: Status, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EMSGSIZE);
        }

        Ok(Self {
            header: Header::response(request, status, payload.len()),
            payload,
        })
    }

    /// Builds a payload-less failure response to `request`.
    pub fn failure(request: &Header, status: Status) -> Self {
        Self {
            header: Header::response(request, status, 0),
            payload: Vec::new(),
        }
    }

    /// Encoded length.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serializes into `out`, returning the number of bytes written.
    ///
    /// The header's size field is rewritten from the payload length.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(EMSGSIZE);
        }

        let mut header = self.header;
        header.size = len as _;
        header.encode(out)?;
        out[HEADER_SIZE..len].copy_from_slice(&self.payload);
        Ok(len)
    }

    /// Serializes into a new buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0; self.encoded_len()];
        // The buffer is exactly the encoded length.
        let _ = self.encode(&mut out);
        out
    }

    /// Deserializes a message whose size field fits within `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Header::decode(bytes)?;
        let size = header.size as usize;
        if size < HEADER_SIZE || size > bytes.len() {
            return Err(EBADMSG);
        }

        Ok(Self {
            header,
            payload: bytes[HEADER_SIZE..size].to_vec(),
        })
    }

    /// Decodes the payload as `T`.
    pub fn payload<T: payload::Payload>(&self) -> Result<T> {
        T::decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::{EAGAIN, ECONNREFUSED};

    #[test]
    fn signature_try_from() {
        for (v, expected) in [
            (0xff11u16, Ok(Signature::Request)),
            (0xff33, Ok(Signature::Response)),
            (0x0000, Err(EBADMSG)),
            (0xff12, Err(EBADMSG)),
            (0x33ff, Err(EBADMSG)),
        ] {
            assert_eq!(v.try_into(), expected, "Invalid mapping for {v:#x}");
        }
    }

    #[test]
    fn op_try_from() {
        for (v, expected) in [
            (0x0000u16, Ok(Op::Invalid)),
            (0x0101, Ok(Op::Create)),
            (0x0002, Ok(Op::Shutdown)),
            (0x0203, Ok(Op::Close)),
            (0x0010, Ok(Op::Connect)),
            (0x0113, Ok(Op::Accept)),
            (0x0420, Ok(Op::Send)),
            (0x0021, Ok(Op::Recv)),
            (0x0430, Ok(Op::GetName)),
            (0x0431, Ok(Op::GetPeer)),
            (0x0033, Ok(Op::PollsetQuery)),
            (0x007f, Ok(Op::Echo)),
            (0x0001, Err(EINVAL)),
            (0x0013, Err(EINVAL)),
            (0x7fff, Err(EINVAL)),
        ] {
            assert_eq!(v.try_into(), expected, "Invalid mapping for {v:#x}");
        }
    }

    #[test]
    fn op_type_flags() {
        assert!(Op::Create.allocates_handle());
        assert!(Op::Accept.allocates_handle());
        assert!(!Op::Connect.allocates_handle());
        assert!(Op::Close.releases_handle());
        assert!(Op::Send.close_waits());
        assert!(!Op::Recv.close_waits());
    }

    #[test]
    fn status() {
        assert!(Status::SUCCESS.is_success());
        assert_eq!(Status::INTERNAL_ERROR.0, 0xc000_0001);
        assert!(Status::INTERNAL_ERROR.is_critical());
        assert!(Status::CHANNEL_DEAD.is_critical());
        assert_eq!(Status::INTERNAL_ERROR.errno(), None);

        let refused = Status::from_errno(ECONNREFUSED);
        assert!(!refused.is_critical());
        assert_eq!(refused.errno(), Some(ECONNREFUSED));
        assert_eq!(Status::from_errno(-EAGAIN), Status::from_errno(EAGAIN));
        assert_eq!(format!("{refused:?}"), "Status(ECONNREFUSED)");
    }

    #[test]
    fn header_layout() {
        let header = Header {
            signature: Signature::Response as _,
            kind: Op::Accept as u16 | RESPONSE_BIT,
            size: 0x40,
            id: 0x0102_0304_0506_0708,
            handle: -1,
            status: Status::from_errno(EAGAIN),
            flags: Flags::REMOTE_CLOSED,
        };

        let mut buf = [0xaau8; HEADER_SIZE];
        header.encode(&mut buf).unwrap();

        #[rustfmt::skip]
        assert_eq!(
            buf,
            [
                0x33, 0xff,             // signature
                0x13, 0x81,             // kind
                0x40, 0, 0, 0,          // size
                8, 7, 6, 5, 4, 3, 2, 1, // id
                0xff, 0xff, 0xff, 0xff, // handle
                11, 0, 0, 0,            // status
                0, 0, 0, 0x80,          // flags
                0, 0, 0, 0,             // reserved
            ]
        );
        assert_eq!(Header::decode(&buf), Ok(header));
        assert_eq!(Header::decode(&buf[..HEADER_SIZE - 1]), Err(EBADMSG));
    }

    #[test]
    fn classify() {
        let req = Message::request(Op::Echo, INVALID_HANDLE, *b"ping").unwrap();
        assert!(req.header.is_request());
        assert!(!req.header.is_response());

        let rsp = Message::response(&req.header, Status::SUCCESS, *b"ping").unwrap();
        assert!(rsp.header.is_response());
        assert_eq!(rsp.header.op(), Ok(Op::Echo));

        let mut garbage = rsp.header;
        garbage.signature = 0xdead;
        assert!(!garbage.is_response());

        let mut short = rsp.header;
        short.size = HEADER_SIZE as u32 - 1;
        assert!(!short.is_response());

        let mut long = rsp.header;
        long.size = MAX_MESSAGE_SIZE as u32 + 1;
        assert!(!long.is_response());
    }

    #[test]
    fn oversized_request() {
        assert!(Message::request(Op::Send, 3, vec![0; MAX_PAYLOAD_SIZE]).is_ok());
        assert_eq!(
            Message::request(Op::Send, 3, vec![0; MAX_PAYLOAD_SIZE + 1]),
            Err(EMSGSIZE)
        );
    }

    #[test]
    fn decode_checks_size() {
        let msg = Message::request(Op::Echo, 7, *b"abc").unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(Message::decode(&bytes), Ok(msg));
        assert_eq!(Message::decode(&bytes[..bytes.len() - 1]), Err(EBADMSG));

        let mut bad = bytes.clone();
        bad[4] = 4;
        assert_eq!(Message::decode(&bad), Err(EBADMSG));
    }
}
