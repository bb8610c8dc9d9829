//! Per-connection state and the read/parse/respond/flush state machine.
//!
//! A connection carries two independently locked halves:
//!
//! - the dispatch gate, touched briefly by the driver thread to decide whether a readiness event
//!   becomes a new task or is queued behind the task already in flight;
//! - the I/O state (socket, buffers, phase), touched only by the single in-flight task.
//!
//! The gate is what guarantees at most one task per connection at any instant.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, info, warn};

use crate::poller::{Readiness, Registrar};
use crate::request::{parse_request, Limits, ParseOutcome};
use crate::response::{Response, StatusCode};
use crate::router::Router;

const READ_CHUNK: usize = 4096;

/// Highest number of tasks ever seen running at once for any single connection.
#[cfg(test)]
pub(crate) static PEAK_TASKS_PER_CONNECTION: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Interest is readable; bytes accumulate until a request completes.
    AwaitingRequest,
    /// Interest is writable; the pending response drains as the socket allows.
    AwaitingResponseFlush,
    Closed,
}

/// What the driver should do with a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// No task was in flight: one has been claimed and must be submitted.
    Submit,
    /// Queued behind the in-flight task, which will process it before finishing.
    Deferred,
    /// The connection is closed; drop the event.
    Skip,
}

/// What the task should do after handling one readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Handle(Readiness),
    Idle,
    TearDown,
}

/// Everything a task needs besides the connection itself.
pub struct Context {
    pub registrar: Registrar,
    pub router: Router,
    pub limits: Limits,
}

#[derive(Default)]
struct Gate {
    in_flight: bool,
    closed: bool,
    pending: VecDeque<Readiness>,
}

struct Io {
    stream: TcpStream,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    phase: Phase,
    close_after_flush: bool,
}

pub struct Connection {
    token: Token,
    peer: Option<SocketAddr>,
    gate: Mutex<Gate>,
    io: Mutex<Io>,
    #[cfg(test)]
    running: AtomicUsize,
}

/// Marks one connection task as running until dropped.
#[cfg(test)]
pub(crate) struct TaskSpan<'a>(&'a AtomicUsize);

#[cfg(test)]
impl Drop for TaskSpan<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Connection {
    pub fn new(token: Token, stream: TcpStream, peer: Option<SocketAddr>) -> Self {
        Self {
            token,
            peer,
            gate: Mutex::new(Gate::default()),
            io: Mutex::new(Io {
                stream,
                read_buf: Vec::with_capacity(READ_CHUNK),
                write_buf: Vec::new(),
                write_pos: 0,
                phase: Phase::AwaitingRequest,
                close_after_flush: false,
            }),
            #[cfg(test)]
            running: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn enter_task(&self) -> TaskSpan<'_> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        PEAK_TASKS_PER_CONNECTION.fetch_max(running, Ordering::SeqCst);
        TaskSpan(&self.running)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.io().phase
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn io(&self) -> MutexGuard<'_, Io> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, registrar: &Registrar) -> io::Result<()> {
        let mut io = self.io();
        registrar.register(&mut io.stream, self.token, Interest::READABLE)
    }

    /// Driver side: claim the connection for a new task, or queue the event behind the task that
    /// already holds it.
    pub fn schedule(&self, readiness: Readiness) -> Schedule {
        let mut gate = self.gate();
        if gate.closed {
            Schedule::Skip
        } else if gate.in_flight {
            if gate.pending.back() != Some(&readiness) {
                gate.pending.push_back(readiness);
            }
            Schedule::Deferred
        } else {
            gate.in_flight = true;
            Schedule::Submit
        }
    }

    /// Task side, after handling one event: continue with the next queued event, release the
    /// claim, or tear down.
    pub fn finish(&self, phase: Phase) -> Next {
        let mut gate = self.gate();
        if phase == Phase::Closed {
            gate.closed = true;
        }
        if gate.closed {
            gate.pending.clear();
            return Next::TearDown;
        }
        match gate.pending.pop_front() {
            Some(readiness) => Next::Handle(readiness),
            None => {
                gate.in_flight = false;
                Next::Idle
            }
        }
    }

    /// Marks the connection closed. Returns `true` if no task is in flight, meaning the caller
    /// owns the teardown; otherwise the in-flight task performs it when it finishes.
    pub fn close(&self) -> bool {
        let mut gate = self.gate();
        gate.closed = true;
        gate.pending.clear();
        !gate.in_flight
    }

    /// Releases the socket: deregisters it and shuts both directions down. The registry entry is
    /// removed by the caller.
    pub fn shutdown(&self, registrar: &Registrar) {
        let mut io = self.io();
        io.phase = Phase::Closed;
        if let Err(err) = registrar.deregister(&mut io.stream) {
            debug!(token = self.token.0, "deregister failed: {err}");
        }
        let _ = io.stream.shutdown(Shutdown::Both);
        io.read_buf = Vec::new();
        io.write_buf = Vec::new();
        io.write_pos = 0;
    }

    /// Runs one readiness event through the state machine and returns the resulting phase.
    pub fn handle(&self, readiness: Readiness, ctx: &Context) -> Phase {
        let mut io = self.io();
        match readiness {
            Readiness::Readable => self.on_readable(&mut io, ctx),
            Readiness::Writable => self.on_writable(&mut io, ctx),
            Readiness::Hangup => io.phase = Phase::Closed,
        }
        io.phase
    }

    fn on_readable(&self, io: &mut Io, ctx: &Context) {
        if io.phase != Phase::AwaitingRequest {
            return;
        }

        let cap = ctx.limits.max_buffered_bytes();
        let peer_closed = match drain_socket(&mut io.stream, &mut io.read_buf, cap) {
            Ok(peer_closed) => peer_closed,
            Err(err) => {
                warn!(token = self.token.0, "read failed: {err}");
                io.phase = Phase::Closed;
                return;
            }
        };

        if self.advance(io, ctx) {
            if peer_closed {
                io.close_after_flush = true;
            }
            self.arm(io, ctx, Interest::WRITABLE);
        } else if peer_closed {
            info!(token = self.token.0, peer = ?self.peer, "peer closed connection");
            io.phase = Phase::Closed;
        }
    }

    fn on_writable(&self, io: &mut Io, ctx: &Context) {
        if io.phase != Phase::AwaitingResponseFlush {
            return;
        }

        while io.write_pos < io.write_buf.len() {
            match io.stream.write(&io.write_buf[io.write_pos..]) {
                Ok(0) => {
                    warn!(token = self.token.0, "socket accepted no bytes");
                    io.phase = Phase::Closed;
                    return;
                }
                Ok(written) => io.write_pos += written,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(token = self.token.0, "write failed: {err}");
                    io.phase = Phase::Closed;
                    return;
                }
            }
        }

        debug!(token = self.token.0, bytes = io.write_buf.len(), "response flushed");
        io.write_buf.clear();
        io.write_pos = 0;
        if io.close_after_flush {
            io.phase = Phase::Closed;
            return;
        }

        io.phase = Phase::AwaitingRequest;
        // Pipelined bytes already sitting in the buffer will not raise another readable edge.
        if self.advance(io, ctx) {
            self.arm(io, ctx, Interest::WRITABLE);
        } else {
            self.arm(io, ctx, Interest::READABLE);
        }
    }

    // Intent: run the parser over the buffered bytes and queue a response when a request frames.
    // Result: returns true when a response is now pending and the phase moved to flushing.
    fn advance(&self, io: &mut Io, ctx: &Context) -> bool {
        let response = match parse_request(&mut io.read_buf, &ctx.limits) {
            ParseOutcome::Incomplete => return false,
            ParseOutcome::Complete(request) => {
                let response = ctx.router.respond(&request);
                info!(
                    token = self.token.0,
                    "{} {} {} -> {}",
                    request.method,
                    request.target,
                    request.version,
                    response.status.as_u16()
                );
                if request.keep_alive() {
                    response
                } else {
                    response.closing()
                }
            }
            ParseOutcome::Malformed(reason) => {
                warn!(token = self.token.0, peer = ?self.peer, "malformed request: {reason}");
                io.read_buf.clear();
                Response::error(StatusCode::BadRequest).closing()
            }
        };

        io.close_after_flush |= response.close;
        io.write_buf = response.to_bytes();
        io.write_pos = 0;
        io.phase = Phase::AwaitingResponseFlush;
        true
    }

    fn arm(&self, io: &mut Io, ctx: &Context, interest: Interest) {
        if let Err(err) = ctx.registrar.modify(&mut io.stream, self.token, interest) {
            warn!(token = self.token.0, "cannot re-arm interest: {err}");
            io.phase = Phase::Closed;
        }
    }
}

/// Reads until the socket would block or `buffer` holds more than `cap` bytes. Returns `true` if
/// the peer closed its side.
///
/// Past `cap` the parser always frames or rejects, so stopping early never strands a request. Any
/// unread bytes are reported again when interest is re-armed.
fn drain_socket<R: Read>(stream: &mut R, buffer: &mut Vec<u8>, cap: usize) -> io::Result<bool> {
    let mut chunk = [0_u8; READ_CHUNK];
    while buffer.len() <= cap {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(read) => buffer.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}
