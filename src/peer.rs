// SPDX-License-Identifier: Apache-2.0

//! Peer servicing loop: the back end of the ring.

use crate::notify::Notifier;
use crate::Errno;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, warn};
use postern::errno::{EINVAL, EMSGSIZE, EOPNOTSUPP};
use postern::message::{Message, Op, Status};
use postern::ring::BackRing;

/// Serves requests arriving on the ring.
pub trait Handler: Send {
    /// Answers one well-formed request.
    ///
    /// A failure is reported to the caller as [`Status::INTERNAL_ERROR`].
    fn handle(&mut self, request: &Message) -> Result<Message>;
}

impl<F> Handler for F
where
    F: FnMut(&Message) -> Result<Message> + Send,
{
    fn handle(&mut self, request: &Message) -> Result<Message> {
        self(request)
    }
}

/// Answers [`Op::Echo`] with its own payload and refuses every other verb.
#[derive(Clone, Copy, Debug, Default)]
pub struct Echo;

impl Handler for Echo {
    fn handle(&mut self, request: &Message) -> Result<Message> {
        match request.header.op() {
            Ok(Op::Echo) => {
                Ok(Message::response(&request.header, Status::SUCCESS, request.payload.clone())
                    .map_err(Errno)?)
            }
            _ => Ok(Message::failure(
                &request.header,
                Status::from_errno(EOPNOTSUPP),
            )),
        }
    }
}

fn respond(handler: &mut dyn Handler, request: &Message) -> Message {
    if !request.header.is_request() {
        warn!("peer: rejecting malformed request {}", request.header.id);
        return Message::failure(&request.header, Status::from_errno(EINVAL));
    }

    match handler.handle(request) {
        Ok(rsp) if rsp.header.is_response() && rsp.header.id == request.header.id => rsp,
        Ok(rsp) => {
            error!(
                "peer: handler answered request {} with {:?}",
                request.header.id, rsp.header
            );
            Message::failure(&request.header, Status::INTERNAL_ERROR)
        }
        Err(e) => {
            error!("peer: handler failed on request {}: {e:#}", request.header.id);
            Message::failure(&request.header, Status::INTERNAL_ERROR)
        }
    }
}

struct Worker {
    back: BackRing,
    notifier: Arc<Notifier>,
    handler: Box<dyn Handler>,
    stop: Arc<AtomicBool>,
    served: Arc<AtomicU64>,
    poll: Duration,
}

impl Worker {
    /// Answers every request visible now. Returns how many.
    fn drain(&mut self) -> Result<u64> {
        let mut count = 0;

        while self.back.has_unconsumed() {
            let request = self
                .back
                .consume_next()
                .map_err(Errno)
                .context("request stream is corrupt")?;
            self.back.advance_consumer();

            let response = respond(&mut *self.handler, &request);
            self.served.fetch_add(1, Ordering::Relaxed);
            let produced = match self.back.try_produce(&response) {
                Err(EMSGSIZE) => {
                    warn!("peer: response {} does not fit a slot", request.header.id);
                    let failure = Message::failure(&request.header, Status::from_errno(EMSGSIZE));
                    self.back.try_produce(&failure)
                }
                other => other,
            };

            // Every consumed request frees exactly one response slot.
            if !produced.map_err(Errno)? {
                bail!("no slot for response {}", request.header.id);
            }
            count += 1;
        }

        Ok(count)
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let stopping = self.stop.load(Ordering::Acquire);

            if self.drain()? > 0 {
                if let Err(e) = self.notifier.signal_peer() {
                    warn!("peer: {e:#}");
                }
            }

            if stopping {
                return Ok(());
            }

            self.notifier
                .wait_for_signal(Some(self.poll))
                .context("failed to wait for requests")?;
        }
    }
}

/// A running servicing loop.
pub struct Server {
    notifier: Arc<Notifier>,
    stop: Arc<AtomicBool>,
    served: Arc<AtomicU64>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("served", &self.served())
            .finish()
    }
}

impl Server {
    /// Takes over the back of the ring and starts serving it with `handler`.
    pub fn start(
        back: BackRing,
        notifier: Notifier,
        handler: impl Handler + 'static,
        poll: Duration,
    ) -> Result<Self> {
        let notifier = Arc::new(notifier);
        let stop = Arc::new(AtomicBool::new(false));
        let served = Arc::new(AtomicU64::new(0));

        let mut worker = Worker {
            back,
            notifier: notifier.clone(),
            handler: Box::new(handler),
            stop: stop.clone(),
            served: served.clone(),
            poll,
        };

        let worker = thread::Builder::new()
            .name("peer".into())
            .spawn(move || {
                info!("peer: serving port {}", worker.notifier.port());
                let result = worker.run();
                if let Err(e) = &result {
                    error!("peer: {e:#}");
                }
                result
            })
            .context("failed to spawn the servicing loop")?;

        Ok(Self {
            notifier,
            stop,
            served,
            worker: Some(worker),
        })
    }

    /// Requests answered so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Answers what is still queued, then stops.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.stop.store(true, Ordering::Release);
        self.notifier.wake_local();
        worker
            .join()
            .map_err(|_| anyhow!("servicing loop panicked"))?
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::sim::Hypervisor;
    use crate::region::Pages;

    use std::time::Instant;

    use postern::message::{Header, MAX_MESSAGE_SIZE};
    use postern::ring::{FrontRing, Sring};

    fn rig(handler: impl Handler + 'static) -> (Server, FrontRing, Notifier) {
        let hv = Hypervisor::new();
        let (a, b) = (hv.capabilities(1), hv.capabilities(2));
        let unbound = a.channels.alloc_unbound(2).unwrap();
        let bound = b.channels.bind_interdomain(1, unbound).unwrap();

        let memory = Arc::new(Pages::new(4).unwrap());
        let back = BackRing::new(Sring::init(memory.clone(), MAX_MESSAGE_SIZE).unwrap());
        let front = FrontRing::new(Sring::attach(memory).unwrap());

        let notifier = Notifier::bind(a.channels, unbound).unwrap();
        let server = Server::start(back, notifier, handler, Duration::from_millis(10)).unwrap();
        (server, front, Notifier::bind(b.channels, bound).unwrap())
    }

    fn exchange(front: &mut FrontRing, notifier: &Notifier, mut request: Message) -> Message {
        request.header.id = 42;
        assert!(front.try_produce(&request).unwrap());
        notifier.signal_peer().unwrap();

        let start = Instant::now();
        while !front.has_unconsumed() {
            assert!(start.elapsed() < Duration::from_secs(5), "no response");
            notifier.wait_for_signal(Some(Duration::from_millis(10))).unwrap();
        }
        let rsp = front.consume_next().unwrap();
        front.advance_consumer();
        rsp
    }

    #[test]
    fn echo() {
        let (server, mut front, notifier) = rig(Echo);

        let rsp = exchange(
            &mut front,
            &notifier,
            Message::request(Op::Echo, 7, *b"hello").unwrap(),
        );
        assert!(rsp.header.is_response());
        assert_eq!(rsp.header.id, 42);
        assert_eq!(rsp.header.handle, 7);
        assert_eq!(rsp.header.status, Status::SUCCESS);
        assert_eq!(rsp.payload, b"hello");

        let rsp = exchange(
            &mut front,
            &notifier,
            Message::request(Op::Listen, 7, 0u32.to_le_bytes()).unwrap(),
        );
        assert_eq!(rsp.header.status.errno(), Some(EOPNOTSUPP));

        assert_eq!(server.served(), 2);
        server.shutdown().unwrap();
    }

    #[test]
    fn malformed_request_gets_einval() {
        let (_server, mut front, notifier) = rig(Echo);

        let mut request = Message::request(Op::Echo, -1, *b"x").unwrap();
        request.header.signature = 0x1234;
        let rsp = exchange(&mut front, &notifier, request);
        assert_eq!(rsp.header.status.errno(), Some(EINVAL));
    }

    #[test]
    fn handler_failure_is_internal_error() {
        let handler = |_: &Message| -> Result<Message> { bail!("no socket layer") };
        let (_server, mut front, notifier) = rig(handler);

        let rsp = exchange(
            &mut front,
            &notifier,
            Message::request(Op::Echo, -1, *b"x").unwrap(),
        );
        assert_eq!(rsp.header.status, Status::INTERNAL_ERROR);
        assert!(rsp.header.status.is_critical());
    }

    #[test]
    fn mismatched_response_is_internal_error() {
        let handler = |req: &Message| -> Result<Message> {
            let mut header = Header::response(&req.header, Status::SUCCESS, 0);
            header.id += 1;
            Ok(Message {
                header,
                payload: vec![],
            })
        };
        let (_server, mut front, notifier) = rig(handler);

        let rsp = exchange(
            &mut front,
            &notifier,
            Message::request(Op::Echo, -1, *b"x").unwrap(),
        );
        assert_eq!(rsp.header.id, 42);
        assert_eq!(rsp.header.status, Status::INTERNAL_ERROR);
    }

    #[test]
    fn shutdown_answers_queued_requests() {
        let (server, mut front, notifier) = rig(Echo);

        let mut request = Message::request(Op::Echo, -1, *b"late").unwrap();
        request.header.id = 9;
        assert!(front.try_produce(&request).unwrap());

        // No signal: the final drain picks it up.
        server.shutdown().unwrap();
        assert!(front.has_unconsumed());
        assert_eq!(front.consume_next().unwrap().payload, b"late");
        drop(notifier);
    }
}
