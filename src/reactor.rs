//! Single-threaded event loop. Each reactor owns its poll, its share of the
//! listening sockets, the connections of every channel pinned to its slot and
//! that slot's outgoing-channel metadata. Other threads talk to a reactor
//! exclusively through its command channel plus waker, so everything that
//! touches a connection runs serialized on the reactor thread without locks.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::{Events, Poll, Token, Waker};

use crate::conn::{Connection, MessageSink, Timeouts, Turn};
use crate::error::{Error, Result};
use crate::handler::{ConnContext, Direction, Handler, Tuner};
use crate::io::{Io, PlainIo};
use crate::listener::Binding;
use crate::logging::{self, Logger};
use crate::resolver::{self, ResolvePolicy};
use crate::server::ServerCore;
use crate::socket::{self, Address, PendingConnect, ReactorListener, StreamSocket};
use crate::tls::{TlsContext, TlsIo};
use crate::{is_outgoing, Channel};

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN_BASE: usize = usize::MAX - 1;

const HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const EVENTS_CAPACITY: usize = 1024;

pub(crate) type TimerTask = Box<dyn FnMut() + Send>;

/// Metadata to (re)establish an outgoing channel after its connection dies.
/// Immutable after creation; the handler produced at allocation time lives
/// here until the channel is forgotten.
pub(crate) struct OutgoingInfo {
    pub host: String,
    pub port: u16,
    pub handler: Arc<dyn Handler>,
    pub tls: Option<TlsContext>,
}

pub(crate) enum Command {
    Send {
        channel: Channel,
        payload: Vec<u8>,
    },
    Disconnect {
        channel: Channel,
        finish_write: bool,
    },
    /// New outgoing channel with an in-flight socket.
    Attach {
        channel: Channel,
        pending: PendingConnect,
        info: Arc<OutgoingInfo>,
    },
    /// New outgoing channel whose first connect attempt already failed;
    /// the metadata is kept so a later send retries.
    AttachFailed {
        channel: Channel,
        info: Arc<OutgoingInfo>,
        error: io::Error,
    },
    Forget {
        channel: Channel,
    },
    Timer {
        after: Duration,
        repeat: Option<Duration>,
        task: TimerTask,
    },
    Shutdown,
}

/// Thread-safe handle to one reactor: enqueue a command, wake the loop.
#[derive(Clone)]
pub(crate) struct ReactorHandle {
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    pub(crate) fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::State("reactor is gone"))?;
        self.waker.wake()?;
        Ok(())
    }
}

struct TimerEntry {
    deadline: Instant,
    repeat: Option<Duration>,
    task: TimerTask,
}

pub(crate) struct Reactor {
    slot: usize,
    core: Arc<ServerCore>,
    poll: Poll,
    rx: Receiver<Command>,
    listeners: Vec<(Token, ReactorListener, Arc<Binding>)>,
    conns: IndexMap<Channel, Connection>,
    outgoing: HashMap<Channel, Arc<OutgoingInfo>>,
    timers: Vec<TimerEntry>,
    resume: VecDeque<Channel>,
    incoming_timeouts: Timeouts,
    outgoing_timeouts: Timeouts,
    tuner: Option<Arc<dyn Tuner>>,
    log: Logger,
    quit: bool,
}

impl Reactor {
    /// Builds a reactor plus its handle. Listener registration happens here
    /// so a bad descriptor fails `initialize` instead of the reactor thread.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slot: usize,
        core: Arc<ServerCore>,
        listeners: Vec<(ReactorListener, Arc<Binding>)>,
        incoming_timeouts: Timeouts,
        outgoing_timeouts: Timeouts,
        tuner: Option<Arc<dyn Tuner>>,
        log: &Logger,
    ) -> Result<(Reactor, ReactorHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut registered = Vec::with_capacity(listeners.len());
        for (index, (mut listener, binding)) in listeners.into_iter().enumerate() {
            let token = Token(LISTENER_TOKEN_BASE - index);
            poll.registry()
                .register(&mut listener, token, mio::Interest::READABLE)?;
            registered.push((token, listener, binding));
        }

        let reactor = Reactor {
            slot,
            core,
            poll,
            rx,
            listeners: registered,
            conns: IndexMap::new(),
            outgoing: HashMap::new(),
            timers: Vec::new(),
            resume: VecDeque::new(),
            incoming_timeouts,
            outgoing_timeouts,
            tuner,
            log: log.new(logging::o!("reactor" => slot)),
            quit: false,
        };

        Ok((reactor, ReactorHandle { tx, waker }))
    }

    pub(crate) fn run(mut self) {
        if let Some(tuner) = &self.tuner {
            if !tuner.on_io_thread_initialize() {
                logging::error!(self.log, "io thread initialization failed");
            }
        }

        logging::debug!(self.log, "reactor running");

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut next_health = Instant::now() + HEALTH_INTERVAL;

        while !self.quit {
            let timeout = self.poll_timeout(next_health);
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "poll failed"; "error" => %err);
                break;
            }

            // Readiness is copied out first: handling an event mutates the
            // connection table.
            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable() || event.is_write_closed() || event.is_error(),
                    )
                })
                .collect();

            for (token, readable, writable) in ready {
                if token == WAKER_TOKEN {
                    continue;
                }

                if token.0 > LISTENER_TOKEN_BASE - self.listeners.len() && token.0 <= LISTENER_TOKEN_BASE {
                    self.accept_all(token);
                    continue;
                }

                let channel = token.0 as Channel;
                if let Some(conn) = self.conns.get_mut(&channel) {
                    let turn = conn.on_event(readable, writable);
                    self.apply_turn(channel, turn);
                }
            }

            self.drain_commands();
            self.continue_writes();
            self.fire_timers();

            let now = Instant::now();
            if now >= next_health {
                next_health = now + HEALTH_INTERVAL;
                self.health_sweep(now);
            }
        }

        self.teardown();
    }

    fn poll_timeout(&self, next_health: Instant) -> Duration {
        if !self.resume.is_empty() {
            return Duration::from_millis(0);
        }

        let now = Instant::now();
        let mut timeout = next_health.saturating_duration_since(now);
        for timer in &self.timers {
            timeout = timeout.min(timer.deadline.saturating_duration_since(now));
        }
        timeout
    }

    fn accept_all(&mut self, token: Token) {
        let index = match self.listeners.iter().position(|(t, _, _)| *t == token) {
            Some(index) => index,
            None => return,
        };

        // Edge-triggered poll: drain the accept queue completely.
        loop {
            let accepted = {
                let (_, listener, _) = &self.listeners[index];
                socket::accept(listener)
            };

            match accepted {
                Ok(None) => return,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    return;
                }
                Ok(Some((stream, peer, me))) => {
                    if !self.core.try_admit_incoming() {
                        // Over the connection limit: the socket is dropped
                        // without any handler callback.
                        logging::warn!(self.log, "incoming connection over limit"; "peer" => %peer);
                        continue;
                    }

                    let binding = self.listeners[index].2.clone();
                    let channel = self.core.allocate_channel(self.slot, false);
                    let handler = binding.source.produce();

                    logging::debug!(self.log, "accepted connection";
                                    "channel" => channel, "peer" => %peer);

                    let installed = self.install(
                        channel,
                        stream,
                        false,
                        false,
                        binding.tls.as_ref(),
                        handler,
                        peer,
                        me,
                        self.incoming_timeouts,
                    );

                    if !installed {
                        self.core.release_incoming();
                    }
                }
            }
        }
    }

    /// Wraps a stream into a connection, registers it and runs the transport
    /// prologue. Returns false when the connection could not even be
    /// installed (no handler callbacks have fired then).
    #[allow(clippy::too_many_arguments)]
    fn install(
        &mut self,
        channel: Channel,
        stream: StreamSocket,
        connecting: bool,
        client: bool,
        tls: Option<&TlsContext>,
        handler: Arc<dyn Handler>,
        peer: Address,
        me: Address,
        timeouts: Timeouts,
    ) -> bool {
        let context = ConnContext::new(channel, me, peer, Arc::downgrade(&self.core));

        let io: Box<dyn Io> = match tls {
            Some(tls) => match TlsIo::new(tls, stream, client, connecting) {
                Ok(io) => Box::new(io),
                Err(err) => {
                    logging::warn!(self.log, "tls setup failed";
                                   "channel" => channel, "error" => %err);
                    return false;
                }
            },
            None => Box::new(PlainIo::new(stream, connecting)),
        };

        let sink: Arc<dyn MessageSink> = self.core.clone();
        let mut conn = Connection::new(io, handler, context, sink, timeouts, &self.log);

        if let Err(err) = conn.register(self.poll.registry(), Token(channel as usize)) {
            logging::warn!(self.log, "registration failed";
                           "channel" => channel, "error" => %err);
            return false;
        }

        let turn = conn.attach();
        self.conns.insert(channel, conn);
        self.apply_turn(channel, turn);
        true
    }

    fn apply_turn(&mut self, channel: Channel, turn: Turn) {
        match turn {
            Turn::Continue => {}
            Turn::MoreWrite => self.resume.push_back(channel),
            Turn::Closed => self.destroy(channel, None),
            Turn::Error(direction, error) => self.destroy(channel, Some((direction, error))),
        }
    }

    fn destroy(&mut self, channel: Channel, failure: Option<(Direction, io::Error)>) {
        if let Some(mut conn) = self.conns.swap_remove(&channel) {
            if let Some((direction, error)) = failure {
                conn.report_error(direction, &error);
            }
            conn.report_disconnected();
            conn.deregister(self.poll.registry());

            if !is_outgoing(channel) {
                self.core.release_incoming();
            }
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.rx.try_recv() {
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
                Ok(command) => self.handle_command(command),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { channel, payload } => self.do_send(channel, payload),
            Command::Disconnect {
                channel,
                finish_write,
            } => {
                if let Some(conn) = self.conns.get_mut(&channel) {
                    let turn = conn.disconnect(finish_write);
                    self.apply_turn(channel, turn);
                }
            }
            Command::Attach {
                channel,
                pending,
                info,
            } => {
                self.outgoing.insert(channel, info.clone());
                self.install(
                    channel,
                    pending.stream,
                    pending.connecting,
                    true,
                    info.tls.as_ref(),
                    info.handler.clone(),
                    pending.peer,
                    pending.local,
                    self.outgoing_timeouts,
                );
            }
            Command::AttachFailed {
                channel,
                info,
                error,
            } => {
                self.outgoing.insert(channel, info.clone());
                self.report_connect_failure(channel, &info, &error);
            }
            Command::Forget { channel } => {
                // The produced handler dies with the metadata once the live
                // connection (if any) is gone.
                self.outgoing.remove(&channel);
            }
            Command::Timer {
                after,
                repeat,
                task,
            } => {
                self.timers.push(TimerEntry {
                    deadline: Instant::now() + after,
                    repeat,
                    task,
                });
            }
            Command::Shutdown => {
                self.quit = true;
            }
        }
    }

    fn do_send(&mut self, channel: Channel, payload: Vec<u8>) {
        if let Some(conn) = self.conns.get_mut(&channel) {
            let turn = conn.send(&payload);
            self.apply_turn(channel, turn);
            return;
        }

        if !is_outgoing(channel) {
            // Disconnected incoming channel: the message is silently dropped.
            return;
        }

        let info = match self.outgoing.get(&channel) {
            Some(info) => info.clone(),
            None => return,
        };

        if self.reconnect(channel, &info) {
            if let Some(conn) = self.conns.get_mut(&channel) {
                let turn = conn.send(&payload);
                self.apply_turn(channel, turn);
            }
        }
    }

    /// Re-establishes an outgoing channel from its metadata. Failures are
    /// reported through the channel's handler; the metadata stays so the
    /// next send retries.
    fn reconnect(&mut self, channel: Channel, info: &Arc<OutgoingInfo>) -> bool {
        logging::debug!(self.log, "reconnecting";
                        "channel" => channel,
                        "host" => %info.host, "port" => info.port);

        let ip = match resolver::global().resolve(
            &info.host,
            ResolvePolicy::Random,
            resolver::DEFAULT_TTL,
        ) {
            Some(ip) => ip,
            None => {
                let error = io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("cannot resolve [{}]", info.host),
                );
                self.report_connect_failure(channel, info, &error);
                return false;
            }
        };

        let pending = match socket::connect_tcp4(ip, info.port) {
            Ok(pending) => pending,
            Err(error) => {
                self.report_connect_failure(channel, info, &error);
                return false;
            }
        };

        let installed = self.install(
            channel,
            pending.stream,
            pending.connecting,
            true,
            info.tls.as_ref(),
            info.handler.clone(),
            pending.peer,
            pending.local,
            self.outgoing_timeouts,
        );

        // A connect refused during installation has already been reported
        // via on_error and destroyed the connection again.
        installed && self.conns.contains_key(&channel)
    }

    fn report_connect_failure(&self, channel: Channel, info: &Arc<OutgoingInfo>, error: &io::Error) {
        logging::warn!(self.log, "outgoing connect failed";
                       "channel" => channel,
                       "host" => %info.host,
                       "error" => %error);

        let peer = match format!("{}:{}", info.host, info.port).parse() {
            Ok(addr) => Address::Inet(addr),
            Err(_) => Address::unspecified(),
        };

        let context = ConnContext::new(
            channel,
            Address::unspecified(),
            peer,
            Arc::downgrade(&self.core),
        );
        info.handler.on_error(&context, Direction::Write, error);
    }

    fn continue_writes(&mut self) {
        let mut round: Vec<Channel> = self.resume.drain(..).collect();
        round.dedup();

        for channel in round {
            if let Some(conn) = self.conns.get_mut(&channel) {
                let turn = conn.continue_write();
                self.apply_turn(channel, turn);
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.timers.len() {
            if self.timers[index].deadline <= now {
                (self.timers[index].task)();
                match self.timers[index].repeat {
                    Some(period) => {
                        self.timers[index].deadline = now + period;
                        index += 1;
                    }
                    None => {
                        self.timers.swap_remove(index);
                    }
                }
            } else {
                index += 1;
            }
        }
    }

    fn health_sweep(&mut self, now: Instant) {
        let stale: Vec<Channel> = self
            .conns
            .iter()
            .filter(|(_, conn)| !conn.cleanup(now))
            .map(|(channel, _)| *channel)
            .collect();

        for channel in stale {
            logging::debug!(self.log, "connection timed out"; "channel" => channel);
            self.destroy(
                channel,
                Some((Direction::Read, io::Error::from(io::ErrorKind::TimedOut))),
            );
        }
    }

    fn teardown(&mut self) {
        logging::debug!(self.log, "reactor stopping";
                        "connections" => self.conns.len());

        let channels: Vec<Channel> = self.conns.keys().copied().collect();
        for channel in channels {
            if let Some(mut conn) = self.conns.swap_remove(&channel) {
                conn.deregister(self.poll.registry());
                if !is_outgoing(channel) {
                    self.core.release_incoming();
                }
            }
        }

        self.outgoing.clear();
        self.timers.clear();
        self.resume.clear();

        if let Some(tuner) = &self.tuner {
            tuner.on_io_thread_shutdown();
        }
    }
}
