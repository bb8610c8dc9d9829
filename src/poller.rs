//! Readiness multiplexer over `mio` (epoll on Linux).
//!
//! mio registrations are always edge-triggered: after a readable event the owner must read until
//! `WouldBlock`, otherwise the event does not fire again. Re-registering a source re-evaluates its
//! readiness, which is what the connection state machine relies on when it flips interest.

use std::io;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
    /// Error or full hang-up. Terminal for the handle.
    Hangup,
}

/// Owns the poll instance. Only the driver thread waits on it.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

/// Cloneable registration handle, usable from any thread.
pub struct Registrar {
    registry: Registry,
}

impl Multiplexer {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity.max(1)),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn registrar(&self) -> io::Result<Registrar> {
        Ok(Registrar {
            registry: self.poll.registry().try_clone()?,
        })
    }

    /// Blocks until at least one handle is ready or `timeout` elapses. A signal interrupting the
    /// wait yields an empty batch; every other failure is fatal for the caller.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Readiness)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }
        Ok(self
            .events
            .iter()
            .filter_map(|event| classify(event).map(|kind| (event.token(), kind)))
            .collect())
    }
}

impl Registrar {
    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.register(source, token, interest)
    }

    pub fn modify<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.reregister(source, token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.deregister(source)
    }
}

// A read-side close alone (peer shut down its write half) is still readable: the zero-length read
// that follows is what closes the connection, after any buffered request has been answered.
fn classify(event: &Event) -> Option<Readiness> {
    if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
        Some(Readiness::Hangup)
    } else if event.is_readable() || event.is_read_closed() {
        Some(Readiness::Readable)
    } else if event.is_writable() {
        Some(Readiness::Writable)
    } else {
        None
    }
}
