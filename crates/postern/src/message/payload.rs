// SPDX-License-Identifier: Apache-2.0

//! Typed payloads for every socket verb.
//!
//! All fields are little-endian. Which payload belongs to which [`Op`](super::Op) is noted on
//! each type; a request and its response usually carry different payloads.

use crate::errno::{EBADMSG, EINVAL};
use crate::{Error, Result};

use bitflags::bitflags;
use core::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddrV4};

/// A payload that can be written behind a message header.
pub trait Payload: Sized {
    /// Appends the encoded payload to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decodes the payload, failing with `EBADMSG` on short input.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.0.len() < n {
            return Err(EBADMSG);
        }

        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(self) -> &'a [u8] {
        self.0
    }
}

/// Protocol family; the two kernels disagree on the native constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Family {
    Unset = 0,
    Inet = 1,
    Inet6 = 2,
}

impl TryFrom<u32> for Family {
    type Error = Error;

    #[inline]
    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Unset),
            1 => Ok(Self::Inet),
            2 => Ok(Self::Inet6),
            _ => Err(EINVAL),
        }
    }
}

/// Socket type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SockType {
    Unset = 0,
    Dgram = 1,
    Stream = 2,
}

impl TryFrom<u32> for SockType {
    type Error = Error;

    #[inline]
    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Unset),
            1 => Ok(Self::Dgram),
            2 => Ok(Self::Stream),
            _ => Err(EINVAL),
        }
    }
}

/// Encoded length of [`SockAddr`].
pub const SOCKADDR_SIZE: usize = 16;

/// IPv4 socket address.
///
/// * family: `u16`
/// * port: `u16`
/// * addr: `[u8; 4]`
/// * zero: `[u8; 8]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockAddr(pub SocketAddrV4);

impl Default for SockAddr {
    fn default() -> Self {
        Self(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }
}

impl Payload for SockAddr {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(Family::Inet as u16).to_le_bytes());
        out.extend_from_slice(&self.0.port().to_le_bytes());
        out.extend_from_slice(&self.0.ip().octets());
        out.extend_from_slice(&[0; 8]);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        if Family::try_from(r.u16()? as u32)? != Family::Inet {
            return Err(EINVAL);
        }

        let port = r.u16()?;
        let ip = r.take(4)?;
        r.take(8)?;
        Ok(Self(SocketAddrV4::new(
            Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
            port,
        )))
    }
}

/// [`Op::Create`](super::Op::Create) request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Create {
    pub family: Family,
    pub kind: SockType,
    pub protocol: u32,
}

impl Payload for Create {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.family as u32).to_le_bytes());
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.protocol.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        Ok(Self {
            family: r.u32()?.try_into()?,
            kind: r.u32()?.try_into()?,
            protocol: r.u32()?,
        })
    }
}

/// A single `u32` argument or result.
///
/// * [`Op::Listen`](super::Op::Listen) request: backlog
/// * [`Op::Shutdown`](super::Op::Shutdown) request: how
/// * [`Op::GetName`](super::Op::GetName) / [`Op::GetPeer`](super::Op::GetPeer) request: maxlen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Word(pub u32);

impl Payload for Word {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Reader(bytes).u32().map(Self)
    }
}

/// [`Op::Accept`](super::Op::Accept) response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accepted {
    pub flags: u32,
    pub peer: SockAddr,
}

impl Payload for Accepted {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        self.peer.encode(out);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        let flags = r.u32()?;
        Ok(Self {
            flags,
            peer: SockAddr::decode(r.rest())?,
        })
    }
}

/// [`Op::Recv`](super::Op::Recv) and [`Op::RecvFrom`](super::Op::RecvFrom) request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Recv {
    pub flags: u32,
    pub requested: u32,
}

impl Payload for Recv {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.requested.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        Ok(Self {
            flags: r.u32()?,
            requested: r.u32()?,
        })
    }
}

/// [`Op::Recv`](super::Op::Recv) response and [`Op::Echo`](super::Op::Echo) payload.
///
/// * count: `u32`
/// * bytes: `[u8; count]`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

fn put_data(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

impl Payload for Data {
    fn encode(&self, out: &mut Vec<u8>) {
        put_data(out, &self.0);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        let count = r.u32()? as usize;
        Ok(Self(r.take(count)?.to_vec()))
    }
}

/// [`Op::RecvFrom`](super::Op::RecvFrom) response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub source: SockAddr,
    pub data: Vec<u8>,
}

impl Payload for Received {
    fn encode(&self, out: &mut Vec<u8>) {
        self.source.encode(out);
        put_data(out, &self.data);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        let source = SockAddr::decode(r.take(SOCKADDR_SIZE)?)?;
        Ok(Self {
            source,
            data: Data::decode(r.rest())?.0,
        })
    }
}

/// [`Op::Send`](super::Op::Send) request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub flags: u32,
    pub data: Vec<u8>,
}

impl Payload for Outbound {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        put_data(out, &self.data);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        let flags = r.u32()?;
        Ok(Self {
            flags,
            data: Data::decode(r.rest())?.0,
        })
    }
}

/// [`Op::Send`](super::Op::Send) response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sent {
    pub flags: u32,
    pub count: u32,
}

impl Payload for Sent {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        Ok(Self {
            flags: r.u32()?,
            count: r.u32()?,
        })
    }
}

/// Socket attribute understood by the back end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Attribute {
    None = 0,
    Nonblock = 1,
    ReuseAddr = 2,
    KeepAlive = 3,
    DeferAccept = 4,
    NoDelay = 5,
}

impl TryFrom<u32> for Attribute {
    type Error = Error;

    #[inline]
    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Nonblock),
            2 => Ok(Self::ReuseAddr),
            3 => Ok(Self::KeepAlive),
            4 => Ok(Self::DeferAccept),
            5 => Ok(Self::NoDelay),
            _ => Err(EINVAL),
        }
    }
}

/// [`Op::Attrib`](super::Op::Attrib) request: set (`modify`) or get one attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attrib {
    pub modify: bool,
    pub attribute: Attribute,
    pub value: u32,
}

impl Payload for Attrib {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.modify as u32).to_le_bytes());
        out.extend_from_slice(&(self.attribute as u32).to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        Ok(Self {
            modify: r.u32()? != 0,
            attribute: r.u32()?.try_into()?,
            value: r.u32()?,
        })
    }
}

bitflags! {
    /// Poll events as carried in a pollset query response.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const IN = 0x001;
        const PRI = 0x002;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
        const NVAL = 0x020;
        const RDNORM = 0x040;
        const RDBAND = 0x080;
        const WRNORM = 0x100;
        const WRBAND = 0x200;
    }
}

/// One ready socket in a pollset query response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollItem {
    pub handle: i32,
    pub events: PollEvents,
}

/// Encoded length of one [`PollItem`].
pub const POLL_ITEM_SIZE: usize = 8;

/// [`Op::PollsetQuery`](super::Op::PollsetQuery) response.
///
/// * count: `u32`
/// * items: `[(handle: i32, events: u32); count]`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pollset(pub Vec<PollItem>);

impl Pollset {
    /// Most items one response can carry.
    pub const MAX_ITEMS: usize = (super::MAX_PAYLOAD_SIZE - 4) / POLL_ITEM_SIZE;
}

impl Payload for Pollset {
    fn encode(&self, out: &mut Vec<u8>) {
        let items = &self.0[..self.0.len().min(Self::MAX_ITEMS)];
        out.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items {
            out.extend_from_slice(&item.handle.to_le_bytes());
            out.extend_from_slice(&item.events.bits().to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        let count = r.u32()? as usize;
        if count > Self::MAX_ITEMS {
            return Err(EBADMSG);
        }

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let handle = r.u32()? as i32;
            let events = PollEvents::from_bits_retain(r.u32()?);
            items.push(PollItem { handle, events });
        }

        Ok(Self(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_layout() {
        let addr = SockAddr("10.0.2.15:8080".parse().unwrap());
        let mut out = Vec::new();
        addr.encode(&mut out);

        #[rustfmt::skip]
        assert_eq!(
            out,
            [
                1, 0,               // family
                0x90, 0x1f,         // port
                10, 0, 2, 15,       // addr
                0, 0, 0, 0, 0, 0, 0, 0, // zero
            ]
        );
        assert_eq!(out.len(), SOCKADDR_SIZE);
        assert_eq!(SockAddr::decode(&out), Ok(addr));

        out[0] = 2;
        assert_eq!(SockAddr::decode(&out), Err(EINVAL));
        assert_eq!(SockAddr::decode(&out[..10]), Err(EINVAL));
    }

    #[test]
    fn enum_try_from() {
        for (v, expected) in [
            (0u32, Ok(Attribute::None)),
            (2, Ok(Attribute::ReuseAddr)),
            (5, Ok(Attribute::NoDelay)),
            (6, Err(EINVAL)),
        ] {
            assert_eq!(v.try_into(), expected, "Invalid mapping for {v}");
        }

        for (v, expected) in [
            (1u32, Ok(SockType::Dgram)),
            (2, Ok(SockType::Stream)),
            (3, Err(EINVAL)),
        ] {
            assert_eq!(v.try_into(), expected, "Invalid mapping for {v}");
        }
    }

    #[test]
    fn short_payloads() {
        assert_eq!(Create::decode(&[1, 0, 0, 0, 2, 0, 0, 0]), Err(EBADMSG));
        assert_eq!(Word::decode(&[1, 2, 3]), Err(EBADMSG));
        assert_eq!(Data::decode(&[5, 0, 0, 0, b'a', b'b']), Err(EBADMSG));
        assert_eq!(Pollset::decode(&[1, 0, 0, 0, 3, 0, 0, 0]), Err(EBADMSG));
    }

    #[test]
    fn send_carries_data() {
        let send = Outbound {
            flags: 0,
            data: b"GET / HTTP/1.0\r\n\r\n".to_vec(),
        };

        let mut out = Vec::new();
        send.encode(&mut out);
        assert_eq!(out.len(), 4 + 4 + send.data.len());
        assert_eq!(Outbound::decode(&out), Ok(send));
    }

    #[test]
    fn pollset_is_capped() {
        let item = PollItem {
            handle: 4,
            events: PollEvents::IN | PollEvents::RDNORM,
        };
        let set = Pollset(vec![item; Pollset::MAX_ITEMS + 3]);

        let mut out = Vec::new();
        set.encode(&mut out);
        assert!(out.len() <= super::super::MAX_PAYLOAD_SIZE);

        let decoded = Pollset::decode(&out).unwrap();
        assert_eq!(decoded.0.len(), Pollset::MAX_ITEMS);
        assert_eq!(decoded.0[0], item);
    }
}
