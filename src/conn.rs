//! Per-connection state machine: socket-level connect, TLS handshake,
//! framed receive path, buffered send path with backpressure, timeouts and
//! graceful shutdown. All methods run on the owning reactor thread.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Registry, Token};

use crate::buffer::Buffer;
use crate::handler::{ConnContext, Direction, Framing, Handler, Verdict};
use crate::io::{Io, IoAction, IoStatus};
use crate::logging::{self, Logger};

const READ_CHUNK: usize = 8192;
const WRITE_CHUNK: usize = 16384;

// Per-writable-run byte budget so one busy connection cannot starve the rest
// of its reactor.
const WRITE_BUDGET: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Handshaking,
    Open,
    HalfClosing,
}

/// What the reactor should do with the connection after an operation.
#[derive(Debug)]
pub(crate) enum Turn {
    /// Nothing to do, keep the connection attached.
    Continue,
    /// Write budget exhausted with bytes still queued; run the write path
    /// again on the next loop turn.
    MoreWrite,
    /// Orderly end of the connection: destroy it, `on_disconnected` only.
    Closed,
    /// Connection failure: `on_error`, then destroy.
    Error(Direction, io::Error),
}

/// Durations of zero disable the respective timeout.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Timeouts {
    pub receive: Duration,
    pub connect: Duration,
    pub send: Duration,
    pub idle: Duration,
}

/// Where complete frames go: queued to the worker pool, or executed inline
/// when no workers are configured.
pub(crate) trait MessageSink: Send + Sync {
    fn dispatch(
        &self,
        context: &Arc<ConnContext>,
        handler: &Arc<dyn Handler>,
        frame: &[u8],
    ) -> Verdict;
}

pub(crate) struct Connection {
    io: Box<dyn Io>,
    handler: Arc<dyn Handler>,
    context: Arc<ConnContext>,
    sink: Arc<dyn MessageSink>,

    state: ConnState,
    graceful: bool,

    rbuf: Buffer,
    pending_frame: usize,
    wbuf: Buffer,

    started: Instant,
    last_received: Instant,
    send_jam: Option<Instant>,
    timeouts: Timeouts,

    log: Logger,
}

impl Connection {
    pub(crate) fn new(
        io: Box<dyn Io>,
        handler: Arc<dyn Handler>,
        context: Arc<ConnContext>,
        sink: Arc<dyn MessageSink>,
        timeouts: Timeouts,
        log: &Logger,
    ) -> Connection {
        let now = Instant::now();

        Connection {
            log: log.new(logging::o!("channel" => context.channel())),
            io,
            handler,
            context,
            sink,
            state: ConnState::Open,
            graceful: false,
            rbuf: Buffer::new(),
            pending_frame: 0,
            wbuf: Buffer::new(),
            started: now,
            last_received: now,
            send_jam: None,
            timeouts,
        }
    }

    #[inline]
    pub(crate) fn context(&self) -> &Arc<ConnContext> {
        &self.context
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.io.register(registry, token)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = self.io.deregister(registry);
    }

    pub(crate) fn report_error(&self, direction: Direction, error: &io::Error) {
        logging::debug!(self.log, "connection error";
                        "direction" => ?direction,
                        "error" => %error);
        self.handler.on_error(&self.context, direction, error);
    }

    pub(crate) fn report_disconnected(&self) {
        logging::debug!(self.log, "connection closed");
        self.handler.on_disconnected(&self.context);
    }

    /// Runs the transport prologue. Called once, right after registration.
    pub(crate) fn attach(&mut self) -> Turn {
        let prologue = self.io.prologue();
        match prologue.immediate {
            IoAction::None => self.to_open(),
            IoAction::Connect => {
                self.state = ConnState::Connecting;
                self.step_opening()
            }
            IoAction::Accept => {
                self.state = ConnState::Handshaking;
                self.step_opening()
            }
            action => {
                logging::error!(self.log, "unexpected prologue action"; "action" => ?action);
                Turn::Error(Direction::Read, inconsistency("unexpected prologue action"))
            }
        }
    }

    /// Readiness dispatch from the reactor.
    pub(crate) fn on_event(&mut self, readable: bool, writable: bool) -> Turn {
        if matches!(self.state, ConnState::Connecting | ConnState::Handshaking) {
            match self.step_opening() {
                Turn::Continue => {
                    if self.state != ConnState::Open {
                        return Turn::Continue;
                    }
                }
                turn => return turn,
            }
        }

        if self.state == ConnState::HalfClosing {
            return self.step_shutdown();
        }

        if readable {
            match self.on_readable() {
                Turn::Continue => {}
                turn => return turn,
            }

            if self.state == ConnState::HalfClosing {
                return Turn::Continue;
            }
        }

        if writable || !self.wbuf.is_empty() {
            return self.on_writable();
        }

        Turn::Continue
    }

    /// Continues a budget-yielded write run.
    pub(crate) fn continue_write(&mut self) -> Turn {
        match self.state {
            ConnState::Open => self.on_writable(),
            ConnState::HalfClosing => self.step_shutdown(),
            _ => Turn::Continue,
        }
    }

    /// Queues or writes bytes. Bytes sent while the connection is still
    /// opening are buffered and flushed once the wire is up.
    pub(crate) fn send(&mut self, data: &[u8]) -> Turn {
        if data.is_empty() || self.graceful {
            return Turn::Continue;
        }

        if matches!(self.state, ConnState::Connecting | ConnState::Handshaking)
            || !self.wbuf.is_empty()
        {
            logging::trace!(self.log, "queueing bytes"; "count" => data.len());
            self.wbuf.append(data);
            return Turn::Continue;
        }

        let mut offset = 0;
        while offset < data.len() {
            let (status, n) = self.io.write(&data[offset..]);
            match status {
                IoStatus::Ok if n > 0 => {
                    offset += n;
                }
                IoStatus::Ok | IoStatus::WantRead | IoStatus::WantWrite => {
                    logging::trace!(self.log, "wire jammed, queueing remainder";
                                    "queued" => data.len() - offset);
                    self.wbuf.append(&data[offset..]);
                    self.set_jam();
                    return Turn::Continue;
                }
                IoStatus::Closed => return Turn::Closed,
                IoStatus::Error(err) => return Turn::Error(Direction::Write, err),
                IoStatus::Bug | IoStatus::Jammed => {
                    return Turn::Error(Direction::Write, inconsistency("write failed"))
                }
            }
        }

        self.clear_jam();
        Turn::Continue
    }

    /// Requests disconnection. With `finish_write` the send buffer is drained
    /// first; otherwise pending bytes are dropped on the floor.
    pub(crate) fn disconnect(&mut self, finish_write: bool) -> Turn {
        if !finish_write {
            self.wbuf.clear();
        }

        self.graceful = true;

        match self.state {
            // A pending connect is simply abandoned.
            ConnState::Connecting | ConnState::Handshaking => Turn::Closed,
            ConnState::HalfClosing => Turn::Continue,
            ConnState::Open => {
                if self.wbuf.is_empty() {
                    self.start_shutdown()
                } else {
                    Turn::Continue
                }
            }
        }
    }

    /// Health check: false once any configured timeout has elapsed.
    pub(crate) fn cleanup(&self, now: Instant) -> bool {
        match self.state {
            ConnState::Connecting | ConnState::Handshaking => !timed_out(
                self.timeouts.connect,
                now.duration_since(self.started),
            ),
            _ => {
                let passed_r = now.duration_since(self.last_received);
                let passed_w = self.send_jam.map(|jam| now.duration_since(jam));
                let idle = match passed_w {
                    Some(passed_w) => passed_r.min(passed_w),
                    None => passed_r,
                };

                !(passed_w.map_or(false, |w| timed_out(self.timeouts.send, w))
                    || timed_out(self.timeouts.receive, passed_r)
                    || timed_out(self.timeouts.idle, idle))
            }
        }
    }

    fn step_opening(&mut self) -> Turn {
        let status = match self.state {
            ConnState::Connecting => self.io.connect(),
            ConnState::Handshaking => self.io.accept(),
            _ => return Turn::Continue,
        };

        match status {
            IoStatus::Ok => self.to_open(),
            IoStatus::WantRead | IoStatus::WantWrite => Turn::Continue,
            IoStatus::Closed => Turn::Closed,
            IoStatus::Error(err) => Turn::Error(Direction::Write, err),
            IoStatus::Bug | IoStatus::Jammed => {
                Turn::Error(Direction::Write, inconsistency("opening failed"))
            }
        }
    }

    fn to_open(&mut self) -> Turn {
        self.state = ConnState::Open;
        self.last_received = Instant::now();

        if let Some(peer) = self.io.tls_peer() {
            self.context.set_tls_peer(peer);
        }

        logging::debug!(self.log, "connection open"; "peer" => %self.context.peer());

        if !self.handler.on_connected(&self.context) {
            return Turn::Closed;
        }

        if self.graceful || !self.wbuf.is_empty() {
            return self.on_writable();
        }

        Turn::Continue
    }

    fn on_readable(&mut self) -> Turn {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let (status, n) = self.io.read(&mut chunk);
            match status {
                IoStatus::Ok => {
                    if n == 0 {
                        return Turn::Continue;
                    }

                    self.last_received = Instant::now();

                    // Data arriving during a graceful close is discarded.
                    if self.graceful {
                        continue;
                    }

                    self.rbuf.append(&chunk[..n]);
                    match self.run_frames() {
                        Turn::Continue => {}
                        turn => return turn,
                    }

                    if self.state != ConnState::Open {
                        return Turn::Continue;
                    }
                }
                IoStatus::WantRead | IoStatus::WantWrite => return Turn::Continue,
                IoStatus::Closed => return Turn::Closed,
                IoStatus::Error(err) => return Turn::Error(Direction::Read, err),
                IoStatus::Bug | IoStatus::Jammed => {
                    return Turn::Error(Direction::Read, inconsistency("read failed"))
                }
            }
        }
    }

    fn run_frames(&mut self) -> Turn {
        loop {
            if self.pending_frame == 0 {
                match self.handler.message_length(&self.context, self.rbuf.as_slice()) {
                    Framing::Pending => break,
                    Framing::Malformed => {
                        return Turn::Error(
                            Direction::Read,
                            io::Error::new(io::ErrorKind::InvalidData, "unrecognized framing"),
                        )
                    }
                    Framing::Frame(0) => {
                        return Turn::Error(
                            Direction::Read,
                            io::Error::new(io::ErrorKind::InvalidData, "zero-length frame"),
                        )
                    }
                    Framing::Frame(length) => {
                        logging::trace!(self.log, "frame length determined"; "length" => length);
                        self.pending_frame = length;
                    }
                }
            }

            if self.rbuf.len() < self.pending_frame {
                break;
            }

            self.last_received = Instant::now();

            let verdict = {
                let frame = &self.rbuf.as_slice()[..self.pending_frame];
                self.sink.dispatch(&self.context, &self.handler, frame)
            };

            match verdict {
                Verdict::Continue => {
                    let length = self.pending_frame;
                    self.pending_frame = 0;
                    self.rbuf.consume(length);
                    if self.rbuf.is_empty() {
                        break;
                    }
                }
                Verdict::Finish => {
                    self.graceful = true;
                    if self.wbuf.is_empty() {
                        return self.start_shutdown();
                    }
                    return Turn::Continue;
                }
                Verdict::Abort => {
                    return Turn::Error(
                        Direction::Read,
                        io::Error::new(io::ErrorKind::Other, "message handler aborted"),
                    )
                }
            }
        }

        Turn::Continue
    }

    fn on_writable(&mut self) -> Turn {
        if self.wbuf.is_empty() {
            self.clear_jam();
            if self.graceful {
                return self.start_shutdown();
            }
            return Turn::Continue;
        }

        let mut sent = 0usize;
        while !self.wbuf.is_empty() {
            let length = self.wbuf.len().min(WRITE_CHUNK);
            let (status, n) = {
                let chunk = &self.wbuf.as_slice()[..length];
                self.io.write(chunk)
            };

            match status {
                IoStatus::Ok if n > 0 => {
                    self.wbuf.consume(n);
                    sent += n;
                    if n < length {
                        self.set_jam();
                    } else {
                        self.clear_jam();
                    }

                    if sent >= WRITE_BUDGET && !self.wbuf.is_empty() {
                        return Turn::MoreWrite;
                    }
                }
                IoStatus::Ok | IoStatus::WantWrite => {
                    self.maybe_jam();
                    return Turn::Continue;
                }
                IoStatus::WantRead => return Turn::Continue,
                IoStatus::Closed => return Turn::Closed,
                IoStatus::Error(err) => return Turn::Error(Direction::Write, err),
                IoStatus::Bug | IoStatus::Jammed => {
                    return Turn::Error(Direction::Write, inconsistency("drain failed"))
                }
            }
        }

        self.clear_jam();
        if self.graceful {
            return self.start_shutdown();
        }

        Turn::Continue
    }

    fn start_shutdown(&mut self) -> Turn {
        logging::debug!(self.log, "shutting down");
        self.state = ConnState::HalfClosing;
        self.step_shutdown()
    }

    fn step_shutdown(&mut self) -> Turn {
        match self.io.shutdown() {
            IoStatus::Ok | IoStatus::Closed => Turn::Closed,
            IoStatus::WantRead | IoStatus::WantWrite => Turn::Continue,
            IoStatus::Error(err) => Turn::Error(Direction::Write, err),
            IoStatus::Bug | IoStatus::Jammed => {
                Turn::Error(Direction::Write, inconsistency("shutdown failed"))
            }
        }
    }

    #[inline]
    fn set_jam(&mut self) {
        self.send_jam = Some(Instant::now());
    }

    #[inline]
    fn maybe_jam(&mut self) {
        if self.send_jam.is_none() {
            self.send_jam = Some(Instant::now());
        }
    }

    #[inline]
    fn clear_jam(&mut self) {
        self.send_jam = None;
    }
}

#[inline]
fn timed_out(timeout: Duration, elapsed: Duration) -> bool {
    timeout > Duration::from_secs(0) && elapsed >= timeout
}

#[inline]
fn inconsistency(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, what)
}
