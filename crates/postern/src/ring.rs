// SPDX-License-Identifier: Apache-2.0

//! Shared ring
//!
//! The ring occupies the whole shared region. A [`Header`] sits at offset 0 and a power-of-two
//! number of fixed-size slots follow it. The same slot first carries a request and later that
//! request's response:
//!
//! * the front end produces requests at `req_prod` and consumes responses up to `rsp_prod`
//! * the back end consumes requests up to `req_prod` and produces responses at `rsp_prod`
//!
//! Only the two producer cursors live in shared memory. Each side keeps its consumer cursor
//! private. The front end may reuse a slot only after it consumed the response written there, so
//! it is full when `req_prod_pvt - rsp_cons == slot_count`. The back end may only write a
//! response for a request it already consumed.
//!
//! A cursor is published with a release store after the slot contents are written, and observed
//! with an acquire load before the slot contents are read. All cursors are `u32` and wrap.

use crate::errno::{EAGAIN, EBADMSG, EINVAL, EMSGSIZE, EOVERFLOW, EPROTO};
use crate::message::{self, Message};
use crate::Result;

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

/// Marks an initialized ring: "PSTN".
pub const MAGIC: u32 = u32::from_le_bytes(*b"PSTN");

/// Ring layout version.
pub const VERSION: u32 = 1;

/// Size of the ring [`Header`].
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Ring header at the start of the shared region.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct Header {
    magic: AtomicU32,
    version: AtomicU32,
    slot_count: AtomicU32,
    slot_size: AtomicU32,
    req_prod: AtomicU32,
    rsp_prod: AtomicU32,
    reserved: [u32; 10],
}

/// Memory shared with the peer.
///
/// # Safety
///
/// `as_ptr()` must point to `len()` bytes that stay mapped for as long as the value lives, and
/// must be aligned for [`Header`]. The bytes may be changed by the peer at any time, so they must
/// only ever be accessed through raw pointer copies and atomics.
pub unsafe trait SharedMemory: Send + Sync {
    /// Start of the shared bytes.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Number of shared bytes.
    fn len(&self) -> usize;

    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Largest power-of-two slot count that fits `len` bytes.
pub fn slot_count(len: usize, slot_size: usize) -> Result<u32> {
    if slot_size < message::HEADER_SIZE || len < HEADER_SIZE + slot_size {
        return Err(EINVAL);
    }

    let fits = (len - HEADER_SIZE) / slot_size;
    let count = 1usize << (usize::BITS - 1 - fits.leading_zeros());
    u32::try_from(count).map_err(|_| EINVAL)
}

/// The shared ring: a header plus slots over [`SharedMemory`].
pub struct Sring {
    memory: Arc<dyn SharedMemory>,
    slot_count: u32,
    slot_size: usize,
}

impl core::fmt::Debug for Sring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sring")
            .field("base", &self.memory.as_ptr())
            .field("slot_count", &self.slot_count)
            .field("slot_size", &self.slot_size)
            .finish()
    }
}

impl Sring {
    fn checked(memory: &Arc<dyn SharedMemory>) -> Result<()> {
        if memory.len() < HEADER_SIZE || memory.as_ptr().as_ptr() as usize % align_of::<Header>() != 0
        {
            return Err(EINVAL);
        }
        Ok(())
    }

    /// Lays out a fresh ring: zeroed cursors, then the magic.
    ///
    /// Must only be called once both sides have the memory mapped.
    pub fn init(memory: Arc<dyn SharedMemory>, slot_size: usize) -> Result<Self> {
        Self::checked(&memory)?;
        let slot_count = slot_count(memory.len(), slot_size)?;

        let ring = Self {
            memory,
            slot_count,
            slot_size,
        };

        let hdr = ring.header();
        hdr.magic.store(0, Ordering::Relaxed);
        hdr.version.store(VERSION, Ordering::Relaxed);
        hdr.slot_count.store(slot_count, Ordering::Relaxed);
        hdr.slot_size.store(slot_size as u32, Ordering::Relaxed);
        hdr.req_prod.store(0, Ordering::Relaxed);
        hdr.rsp_prod.store(0, Ordering::Relaxed);
        hdr.magic.store(MAGIC, Ordering::Release);

        Ok(ring)
    }

    /// Attaches to a ring the peer laid out.
    ///
    /// Fails with `EAGAIN` while the magic is not there yet.
    pub fn attach(memory: Arc<dyn SharedMemory>) -> Result<Self> {
        Self::checked(&memory)?;

        // SAFETY: checked() verified size and alignment.
        let hdr = unsafe { &*(memory.as_ptr().as_ptr() as *const Header) };
        if hdr.magic.load(Ordering::Acquire) != MAGIC {
            return Err(EAGAIN);
        }
        if hdr.version.load(Ordering::Relaxed) != VERSION {
            return Err(EPROTO);
        }

        let slot_count = hdr.slot_count.load(Ordering::Relaxed);
        let slot_size = hdr.slot_size.load(Ordering::Relaxed) as usize;
        if !slot_count.is_power_of_two()
            || slot_size < message::HEADER_SIZE
            || HEADER_SIZE + slot_count as usize * slot_size > memory.len()
        {
            return Err(EINVAL);
        }

        Ok(Self {
            memory,
            slot_count,
            slot_size,
        })
    }

    /// Clears the magic so that no one attaches to a retired ring.
    pub fn retire(&self) {
        self.header().magic.store(0, Ordering::Release);
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    fn header(&self) -> &Header {
        // SAFETY: size and alignment were checked on construction and the memory outlives self.
        unsafe { &*(self.memory.as_ptr().as_ptr() as *const Header) }
    }

    fn slot(&self, idx: u32) -> *mut u8 {
        let offset = HEADER_SIZE + (idx & (self.slot_count - 1)) as usize * self.slot_size;
        // SAFETY: offset + slot_size is within the memory by construction.
        unsafe { self.memory.as_ptr().as_ptr().add(offset) }
    }

    fn write(&self, idx: u32, msg: &Message) -> Result<()> {
        let len = msg.encoded_len();
        if len > self.slot_size {
            return Err(EMSGSIZE);
        }

        let bytes = msg.to_bytes();
        // SAFETY: the slot is slot_size bytes long and owned by this producer until published.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot(idx), len) };
        Ok(())
    }

    fn read(&self, idx: u32) -> Result<Message> {
        let slot = self.slot(idx);

        let mut head = [0u8; message::HEADER_SIZE];
        // SAFETY: every slot holds at least a message header.
        unsafe { ptr::copy_nonoverlapping(slot, head.as_mut_ptr(), head.len()) };

        let header = message::Header::decode(&head)?;
        let size = header.size as usize;
        if size < message::HEADER_SIZE || size > self.slot_size {
            return Err(EBADMSG);
        }

        let mut payload = vec![0u8; size - message::HEADER_SIZE];
        // SAFETY: size was checked against the slot.
        unsafe {
            ptr::copy_nonoverlapping(
                slot.add(message::HEADER_SIZE),
                payload.as_mut_ptr(),
                payload.len(),
            )
        };

        Ok(Message { header, payload })
    }
}

/// Which of the two message streams a half works on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Requests,
    Responses,
}

impl Stream {
    fn cursor(self, hdr: &Header) -> &AtomicU32 {
        match self {
            Self::Requests => &hdr.req_prod,
            Self::Responses => &hdr.rsp_prod,
        }
    }
}

/// Producing half of one end.
#[derive(Debug)]
pub struct Producer {
    ring: Arc<Sring>,
    stream: Stream,
    pvt: u32,
    // Consumer cursor of the sibling half on the same end.
    bound: Arc<AtomicU32>,
}

impl Producer {
    /// Free slots for this producer.
    pub fn free(&self) -> u32 {
        let bound = self.bound.load(Ordering::Acquire);
        match self.stream {
            Stream::Requests => self.ring.slot_count - self.pvt.wrapping_sub(bound),
            Stream::Responses => bound.wrapping_sub(self.pvt),
        }
    }

    /// Copies `msg` into the next slot and publishes it.
    ///
    /// Returns `Ok(false)` when the ring is full; nothing is written then.
    pub fn try_produce(&mut self, msg: &Message) -> Result<bool> {
        if self.free() == 0 {
            return Ok(false);
        }

        self.ring.write(self.pvt, msg)?;
        self.pvt = self.pvt.wrapping_add(1);

        // The slot must be complete before the peer can see the new cursor.
        fence(Ordering::Release);
        self.stream
            .cursor(self.ring.header())
            .store(self.pvt, Ordering::Release);
        Ok(true)
    }

    /// Messages produced so far.
    #[inline]
    pub fn produced(&self) -> u32 {
        self.pvt
    }
}

/// Consuming half of one end.
#[derive(Debug)]
pub struct Consumer {
    ring: Arc<Sring>,
    stream: Stream,
    cons: Arc<AtomicU32>,
}

impl Consumer {
    fn prod(&self) -> u32 {
        self.stream
            .cursor(self.ring.header())
            .load(Ordering::Acquire)
    }

    /// Has the peer published messages this half has not consumed?
    pub fn has_unconsumed(&self) -> bool {
        self.prod() != self.cons.load(Ordering::Relaxed)
    }

    /// Reads the message at the consumer cursor without advancing it.
    ///
    /// The caller must have seen [`has_unconsumed`](Self::has_unconsumed). Fails with
    /// `EOVERFLOW` if the peer published more than the ring holds, and with `EBADMSG` if the
    /// size in the slot does not fit the slot.
    pub fn consume_next(&self) -> Result<Message> {
        let prod = self.prod();
        let cons = self.cons.load(Ordering::Relaxed);
        if prod == cons {
            return Err(EAGAIN);
        }
        if prod.wrapping_sub(cons) > self.ring.slot_count {
            return Err(EOVERFLOW);
        }

        // Pairs with the producer's release fence.
        fence(Ordering::Acquire);
        self.ring.read(cons)
    }

    /// Releases the slot at the consumer cursor.
    pub fn advance_consumer(&mut self) {
        let cons = self.cons.load(Ordering::Relaxed);
        self.cons.store(cons.wrapping_add(1), Ordering::Release);
    }

    /// Messages consumed so far.
    #[inline]
    pub fn consumed(&self) -> u32 {
        self.cons.load(Ordering::Relaxed)
    }
}

fn halves(ring: Sring, produce: Stream, consume: Stream) -> (Producer, Consumer) {
    let ring = Arc::new(ring);
    let cons = Arc::new(AtomicU32::new(0));

    let producer = Producer {
        ring: ring.clone(),
        stream: produce,
        pvt: produce.cursor(ring.header()).load(Ordering::Acquire),
        bound: cons.clone(),
    };

    let consumer = Consumer {
        ring,
        stream: consume,
        cons,
    };

    (producer, consumer)
}

macro_rules! end {
    ($(#[$attr:meta])* $name:ident, $produce:expr, $consume:expr) => {
        $(#[$attr])*
        #[derive(Debug)]
        pub struct $name {
            producer: Producer,
            consumer: Consumer,
        }

        impl $name {
            pub fn new(ring: Sring) -> Self {
                let (producer, consumer) = halves(ring, $produce, $consume);
                Self { producer, consumer }
            }

            /// See [`Producer::try_produce`].
            #[inline]
            pub fn try_produce(&mut self, msg: &Message) -> Result<bool> {
                self.producer.try_produce(msg)
            }

            /// See [`Consumer::has_unconsumed`].
            #[inline]
            pub fn has_unconsumed(&self) -> bool {
                self.consumer.has_unconsumed()
            }

            /// See [`Consumer::consume_next`].
            #[inline]
            pub fn consume_next(&self) -> Result<Message> {
                self.consumer.consume_next()
            }

            /// See [`Consumer::advance_consumer`].
            #[inline]
            pub fn advance_consumer(&mut self) {
                self.consumer.advance_consumer()
            }

            /// Splits into halves that can live on different threads.
            pub fn split(self) -> (Producer, Consumer) {
                (self.producer, self.consumer)
            }
        }
    };
}

end!(
    /// Front end: produces requests, consumes responses.
    FrontRing,
    Stream::Requests,
    Stream::Responses
);

end!(
    /// Back end: consumes requests, produces responses.
    BackRing,
    Stream::Responses,
    Stream::Requests
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Op, Status, MAX_MESSAGE_SIZE};

    use testaso::testaso;

    testaso! {
        struct Header: 64, 64 => {
            magic: 0,
            version: 4,
            slot_count: 8,
            slot_size: 12,
            req_prod: 16,
            rsp_prod: 20,
            reserved: 24
        }
    }

    #[repr(C, align(64))]
    struct Line([u8; 64]);

    struct Memory(Box<[Line]>);

    impl Memory {
        fn new(len: usize) -> Arc<dyn SharedMemory> {
            Arc::new(Self((0..len / 64).map(|_| Line([0; 64])).collect()))
        }
    }

    unsafe impl SharedMemory for Memory {
        fn as_ptr(&self) -> NonNull<u8> {
            NonNull::new(self.0.as_ptr() as *mut u8).unwrap()
        }

        fn len(&self) -> usize {
            self.0.len() * 64
        }
    }

    fn pair(len: usize) -> (FrontRing, BackRing) {
        let memory = Memory::new(len);
        let front = FrontRing::new(Sring::init(memory.clone(), MAX_MESSAGE_SIZE).unwrap());
        let back = BackRing::new(Sring::attach(memory).unwrap());
        (front, back)
    }

    fn echo(payload: &[u8]) -> Message {
        Message::request(Op::Echo, -1, payload.to_vec()).unwrap()
    }

    #[test]
    fn geometry() {
        for (len, slot, expected) in [
            (4096, 2048, Ok(1)),
            (4 * 4096, 2048, Ok(4)),
            (16 * 4096, 2048, Ok(16)),
            (16 * 4096, 4096, Ok(8)),
            (HEADER_SIZE + 3 * 512, 512, Ok(2)),
            (HEADER_SIZE + 511, 512, Err(EINVAL)),
            (4096, 16, Err(EINVAL)),
        ] {
            assert_eq!(slot_count(len, slot), expected, "Invalid geometry for {len}/{slot}");
        }
    }

    #[test]
    fn attach_needs_magic() {
        let memory = Memory::new(4 * 4096);
        assert_eq!(Sring::attach(memory.clone()).unwrap_err(), EAGAIN);

        let ring = Sring::init(memory.clone(), MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(ring.slot_count(), 4);
        assert!(Sring::attach(memory.clone()).is_ok());

        ring.retire();
        assert_eq!(Sring::attach(memory).unwrap_err(), EAGAIN);
    }

    #[test]
    fn request_response_cycle() {
        let (mut front, mut back) = pair(8 * 4096);
        assert!(!back.has_unconsumed());
        assert!(!front.has_unconsumed());

        let mut req = echo(b"hello");
        req.header.id = 7;
        assert_eq!(front.try_produce(&req), Ok(true));

        assert!(back.has_unconsumed());
        let got = back.consume_next().unwrap();
        assert_eq!(got, req);
        back.advance_consumer();
        assert!(!back.has_unconsumed());

        let rsp = Message::response(&got.header, Status::SUCCESS, got.payload.clone()).unwrap();
        assert_eq!(back.try_produce(&rsp), Ok(true));

        assert!(front.has_unconsumed());
        let got = front.consume_next().unwrap();
        assert!(got.header.is_response());
        assert_eq!(got.header.id, 7);
        assert_eq!(got.payload, b"hello");
        front.advance_consumer();
        assert!(!front.has_unconsumed());
    }

    #[test]
    fn front_full_until_responses_consumed() {
        let (mut front, mut back) = pair(HEADER_SIZE + 4 * MAX_MESSAGE_SIZE);
        let n = 4;

        for i in 0..n {
            assert_eq!(front.try_produce(&echo(&[i as u8])), Ok(true), "slot {i}");
        }
        assert_eq!(front.try_produce(&echo(b"x")), Ok(false));

        // Consuming requests alone does not free slots for the front.
        for _ in 0..n {
            let req = back.consume_next().unwrap();
            back.advance_consumer();
            let rsp = Message::response(&req.header, Status::SUCCESS, req.payload).unwrap();
            assert_eq!(back.try_produce(&rsp), Ok(true));
        }
        assert_eq!(front.try_produce(&echo(b"x")), Ok(false));

        let got = front.consume_next().unwrap();
        assert_eq!(got.payload, [0]);
        front.advance_consumer();
        assert_eq!(front.try_produce(&echo(b"x")), Ok(true));
    }

    #[test]
    fn back_cannot_answer_unread_requests() {
        let (mut front, mut back) = pair(4 * 4096);
        let req = echo(b"a");
        let rsp = Message::response(&req.header, Status::SUCCESS, Vec::new()).unwrap();
        assert_eq!(back.try_produce(&rsp), Ok(false));

        front.try_produce(&req).unwrap();
        assert_eq!(back.try_produce(&rsp), Ok(false));

        back.consume_next().unwrap();
        back.advance_consumer();
        assert_eq!(back.try_produce(&rsp), Ok(true));
        assert_eq!(back.try_produce(&rsp), Ok(false));
    }

    #[test]
    fn slots_are_reused() {
        let (mut front, mut back) = pair(2 * 4096);
        for i in 0..1000u32 {
            let req = echo(&i.to_le_bytes());
            assert_eq!(front.try_produce(&req), Ok(true));

            let got = back.consume_next().unwrap();
            back.advance_consumer();
            let rsp = Message::response(&got.header, Status::SUCCESS, got.payload).unwrap();
            assert_eq!(back.try_produce(&rsp), Ok(true));

            let got = front.consume_next().unwrap();
            assert_eq!(got.payload, i.to_le_bytes());
            front.advance_consumer();
        }
    }

    #[test]
    fn oversized_message() {
        let memory = Memory::new(4 * 4096);
        let mut front = FrontRing::new(Sring::init(memory, 512).unwrap());
        let msg = echo(&[0; 600]);
        assert_eq!(front.try_produce(&msg), Err(EMSGSIZE));
        assert_eq!(front.try_produce(&echo(&[0; 100])), Ok(true));
    }

    /// A third view of the memory, standing in for a misbehaving peer.
    fn rigged(slot_size: usize) -> (FrontRing, BackRing, Sring) {
        let memory = Memory::new(4 * 4096);
        let front = FrontRing::new(Sring::init(memory.clone(), slot_size).unwrap());
        let back = BackRing::new(Sring::attach(memory.clone()).unwrap());
        (front, back, Sring::attach(memory).unwrap())
    }

    fn poke_size(raw: &Sring, idx: u32, size: u32) {
        // The size field follows signature and kind.
        unsafe { ptr::copy_nonoverlapping(size.to_le_bytes().as_ptr(), raw.slot(idx).add(4), 4) };
    }

    #[test]
    fn size_must_fit_the_slot() {
        let (mut front, mut back, raw) = rigged(512);

        front.try_produce(&echo(b"x")).unwrap();
        let req = back.consume_next().unwrap();
        back.advance_consumer();
        let rsp = Message::response(&req.header, Status::SUCCESS, vec![7; 100]).unwrap();
        back.try_produce(&rsp).unwrap();

        // 1000 is a legal message size, just not for 512-byte slots.
        for size in [1000, 513, message::HEADER_SIZE as u32 - 1, 0] {
            poke_size(&raw, 0, size);
            assert_eq!(front.consume_next(), Err(EBADMSG), "size {size}");
        }

        poke_size(&raw, 0, (message::HEADER_SIZE + 100) as u32);
        assert_eq!(front.consume_next(), Ok(rsp));
    }

    #[test]
    fn cursor_past_capacity_overflows() {
        let (front, back, raw) = rigged(MAX_MESSAGE_SIZE);
        let beyond = raw.slot_count() + 1;

        raw.header().req_prod.store(beyond, Ordering::Release);
        assert!(back.has_unconsumed());
        assert_eq!(back.consume_next(), Err(EOVERFLOW));

        raw.header().rsp_prod.store(beyond, Ordering::Release);
        assert!(front.has_unconsumed());
        assert_eq!(front.consume_next(), Err(EOVERFLOW));
    }

    #[test]
    fn split_halves_share_progress() {
        let (front, mut back) = pair(HEADER_SIZE + MAX_MESSAGE_SIZE);
        let (mut requests, mut responses) = front.split();
        assert_eq!(requests.free(), 1);

        requests.try_produce(&echo(b"one")).unwrap();
        assert_eq!(requests.free(), 0);

        let req = back.consume_next().unwrap();
        back.advance_consumer();
        back.try_produce(&Message::failure(&req.header, Status::INTERNAL_ERROR))
            .unwrap();

        let rsp = responses.consume_next().unwrap();
        assert_eq!(rsp.header.status, Status::INTERNAL_ERROR);
        responses.advance_consumer();
        assert_eq!(requests.free(), 1);
        assert_eq!(requests.produced(), 1);
        assert_eq!(responses.consumed(), 1);
    }
}
