//! The server façade: owns the reactor and worker threads, the listeners and
//! the channel number space, and routes thread-safe `send`/`disconnect`/
//! `forget` calls to the reactor owning the channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::conn::{MessageSink, Timeouts};
use crate::error::{Error, Result};
use crate::handler::{ConnContext, Handler, HandlerFactory, HandlerSource, Tuner, Verdict};
use crate::jobs::{self, Job, JobQueue};
use crate::listener::{Binding, Listener};
use crate::logging::{self, Logger};
use crate::reactor::{Command, OutgoingInfo, Reactor, ReactorHandle, TimerTask};
use crate::resolver::{self, ResolvePolicy};
use crate::socket::{self, Address};
use crate::tls::TlsContext;
use crate::{slot_of, Channel, INVALID_CHANNEL, OUTGOING_BIT};

pub const MAXIMUM_SLOTS: usize = 128;
pub const MAXIMUM_WORKERS: usize = 16384;

/// Connection tuning, set before `initialize`. Timeouts of zero are
/// disabled.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configure {
    pub incoming_receive_timeout: Duration,
    pub incoming_connect_timeout: Duration,
    pub incoming_send_timeout: Duration,
    pub incoming_idle_timeout: Duration,

    pub outgoing_receive_timeout: Duration,
    pub outgoing_connect_timeout: Duration,
    pub outgoing_send_timeout: Duration,
    pub outgoing_idle_timeout: Duration,

    /// Accepted sockets above this limit are closed without any callback.
    pub maximum_incoming_connections: usize,
}

impl Default for Configure {
    fn default() -> Configure {
        Configure {
            incoming_receive_timeout: Duration::from_secs(5),
            incoming_connect_timeout: Duration::from_secs(5),
            incoming_send_timeout: Duration::from_secs(5),
            incoming_idle_timeout: Duration::from_secs(60),
            outgoing_receive_timeout: Duration::from_secs(5),
            outgoing_connect_timeout: Duration::from_secs(5),
            outgoing_send_timeout: Duration::from_secs(5),
            outgoing_idle_timeout: Duration::from_secs(60),
            maximum_incoming_connections: 50000,
        }
    }
}

impl Configure {
    pub(crate) fn incoming_timeouts(&self) -> Timeouts {
        Timeouts {
            receive: self.incoming_receive_timeout,
            connect: self.incoming_connect_timeout,
            send: self.incoming_send_timeout,
            idle: self.incoming_idle_timeout,
        }
    }

    pub(crate) fn outgoing_timeouts(&self) -> Timeouts {
        Timeouts {
            receive: self.outgoing_receive_timeout,
            connect: self.outgoing_connect_timeout,
            send: self.outgoing_send_timeout,
            idle: self.outgoing_idle_timeout,
        }
    }
}

/// Shared state reachable from reactors, workers and connection contexts.
/// Holds no thread handles, so contexts referencing it (weakly) never keep
/// threads alive.
pub(crate) struct ServerCore {
    pub(crate) log: Logger,
    pub(crate) jobs: JobQueue,
    workers: AtomicUsize,
    slots: AtomicUsize,
    counters: Mutex<Vec<u64>>,
    incoming: AtomicUsize,
    max_incoming: AtomicUsize,
    handles: Mutex<Vec<ReactorHandle>>,
}

impl ServerCore {
    fn new(log: Logger) -> ServerCore {
        ServerCore {
            log,
            jobs: JobQueue::new(),
            workers: AtomicUsize::new(0),
            slots: AtomicUsize::new(0),
            counters: Mutex::new(Vec::new()),
            incoming: AtomicUsize::new(0),
            max_incoming: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a channel pinned to `slot`. Counters only ever grow, so a
    /// channel value is never reissued within the process, restarts
    /// included.
    pub(crate) fn allocate_channel(&self, slot: usize, outgoing: bool) -> Channel {
        let slots = self.slots.load(Ordering::Relaxed) as u64;
        let mut counters = self.counters.lock();
        let counter = &mut counters[slot];
        *counter += slots;

        if outgoing {
            *counter | OUTGOING_BIT
        } else {
            *counter
        }
    }

    /// Sizes the counter table for `slots` reactors, preserving monotonicity
    /// across restarts even when the slot count changes.
    fn setup_counters(&self, slots: usize) {
        let mut counters = self.counters.lock();
        if counters.len() == slots {
            return;
        }

        let highest = counters.iter().copied().max().unwrap_or(0);
        let base = (highest / slots as u64 + 1) * slots as u64;
        *counters = (0..slots).map(|slot| base + slot as u64).collect();
    }

    /// Admission check for one more incoming connection.
    pub(crate) fn try_admit_incoming(&self) -> bool {
        let limit = self.max_incoming.load(Ordering::Relaxed);
        let prior = self.incoming.fetch_add(1, Ordering::Relaxed);
        if prior >= limit {
            self.incoming.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub(crate) fn release_incoming(&self) {
        self.incoming.fetch_sub(1, Ordering::Relaxed);
    }

    fn handle_for(&self, channel: Channel) -> Result<ReactorHandle> {
        if channel == INVALID_CHANNEL {
            return Err(Error::State("invalid channel"));
        }

        let handles = self.handles.lock();
        if handles.is_empty() {
            return Err(Error::State("server not running"));
        }

        Ok(handles[slot_of(channel, handles.len())].clone())
    }

    pub(crate) fn send(&self, channel: Channel, data: &[u8]) -> Result<()> {
        self.handle_for(channel)?.command(Command::Send {
            channel,
            payload: data.to_vec(),
        })
    }

    pub(crate) fn disconnect(&self, channel: Channel, finish_write: bool) -> Result<()> {
        self.handle_for(channel)?.command(Command::Disconnect {
            channel,
            finish_write,
        })
    }

    pub(crate) fn forget(&self, channel: Channel) {
        if let Ok(handle) = self.handle_for(channel) {
            let _ = handle.command(Command::Forget { channel });
        }
    }

    fn register_timer(&self, after: Duration, repeat: Option<Duration>, task: TimerTask) -> Result<()> {
        let handle = {
            let handles = self.handles.lock();
            if handles.is_empty() {
                return Err(Error::State("server not running"));
            }
            handles[rand::thread_rng().gen_range(0..handles.len())].clone()
        };

        handle.command(Command::Timer {
            after,
            repeat,
            task,
        })
    }
}

impl MessageSink for ServerCore {
    /// Queue the message to the worker pool, or run it inline when no
    /// workers are configured.
    fn dispatch(
        &self,
        context: &Arc<ConnContext>,
        handler: &Arc<dyn Handler>,
        frame: &[u8],
    ) -> Verdict {
        if self.workers.load(Ordering::Relaxed) > 0 {
            self.jobs
                .push(Some(Job::new(context.clone(), handler.clone(), frame.to_vec())));
            return Verdict::Continue;
        }

        handler.on_message(context, frame)
    }
}

struct Facade {
    running: bool,
    configure: Configure,
    listeners: Vec<Listener>,
    staged_timers: Vec<(Duration, Option<Duration>, TimerTask)>,
    threads: Vec<JoinHandle<()>>,
    workers: usize,
}

/// Multi-threaded connection server and client.
///
/// Usage follows a strict order: `configure` and `listen*` first, then
/// `initialize`, then any of the thread-safe operations, finally
/// `shutdown` (also run on drop).
pub struct Server {
    core: Arc<ServerCore>,
    state: Mutex<Facade>,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Server {
        let log = logging::child(log, logging::o!("subsystem" => "server"));

        Server {
            core: Arc::new(ServerCore::new(log)),
            state: Mutex::new(Facade {
                running: false,
                configure: Configure::default(),
                listeners: Vec::new(),
                staged_timers: Vec::new(),
                threads: Vec::new(),
                workers: 0,
            }),
        }
    }

    /// Replaces the connection tuning. Call before `initialize`.
    pub fn configure(&self, configure: Configure) {
        let mut facade = self.state.lock();
        assert!(!facade.running, "configure must precede initialize");
        facade.configure = configure;
    }

    /// Listens for clear-text connections on an IPv4 TCP port. Returns the
    /// bound address, so port 0 picks a free port.
    pub fn listen(&self, port: u16, handler: Arc<dyn Handler>) -> Result<SocketAddr> {
        self.do_listen_tcp(port, HandlerSource::Shared(handler), None)
    }

    /// Like `listen`, producing one handler per accepted connection.
    pub fn listen_with_factory(
        &self,
        port: u16,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<SocketAddr> {
        self.do_listen_tcp(port, HandlerSource::Factory(factory), None)
    }

    /// Listens for TLS connections.
    pub fn ssl_listen(
        &self,
        port: u16,
        tls: &TlsContext,
        handler: Arc<dyn Handler>,
    ) -> Result<SocketAddr> {
        self.do_listen_tcp(port, HandlerSource::Shared(handler), Some(tls.clone()))
    }

    /// Like `ssl_listen`, producing one handler per accepted connection.
    pub fn ssl_listen_with_factory(
        &self,
        port: u16,
        tls: &TlsContext,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<SocketAddr> {
        self.do_listen_tcp(port, HandlerSource::Factory(factory), Some(tls.clone()))
    }

    /// Listens on an IPv6 TCP port; the any-interface socket also accepts
    /// IPv4-mapped connections.
    pub fn listen6(&self, port: u16, handler: Arc<dyn Handler>) -> Result<SocketAddr> {
        let mut facade = self.state.lock();
        assert!(!facade.running, "listen must precede initialize");

        let binding = Binding {
            source: HandlerSource::Shared(handler),
            tls: None,
        };
        let listener = Listener::tcp6(port, false, binding, &self.core.log)?;
        let address = listener
            .local()
            .inet()
            .expect("tcp listener has an inet address");

        facade.listeners.push(listener);
        Ok(address)
    }

    /// Listens on a Unix domain socket, file-based or abstract.
    pub fn listen_unix(
        &self,
        path: &str,
        file_based: bool,
        privileged: bool,
        handler: Arc<dyn Handler>,
    ) -> Result<Address> {
        let mut facade = self.state.lock();
        assert!(!facade.running, "listen must precede initialize");

        let binding = Binding {
            source: HandlerSource::Shared(handler),
            tls: None,
        };
        let listener = Listener::unix(path, file_based, privileged, binding, &self.core.log)?;
        let address = listener.local().clone();

        facade.listeners.push(listener);
        Ok(address)
    }

    fn do_listen_tcp(
        &self,
        port: u16,
        source: HandlerSource,
        tls: Option<TlsContext>,
    ) -> Result<SocketAddr> {
        let mut facade = self.state.lock();
        assert!(!facade.running, "listen must precede initialize");

        let listener = Listener::tcp(port, false, Binding { source, tls }, &self.core.log)?;
        let address = listener
            .local()
            .inet()
            .expect("tcp listener has an inet address");

        facade.listeners.push(listener);
        Ok(address)
    }

    /// Spawns `slots` reactor threads and `workers` job threads, attaching
    /// every listener to every reactor. With zero workers, messages are
    /// handled inline on the reactor threads.
    pub fn initialize(
        &self,
        slots: usize,
        workers: usize,
        tuner: Option<Arc<dyn Tuner>>,
    ) -> Result<()> {
        if slots == 0 || slots > MAXIMUM_SLOTS {
            return Err(Error::Config(format!("invalid reactor count: {}", slots)));
        }
        if workers > MAXIMUM_WORKERS {
            return Err(Error::Config(format!("invalid worker count: {}", workers)));
        }

        let mut facade = self.state.lock();
        if facade.running {
            return Err(Error::State("already initialized"));
        }

        match self.do_initialize(&mut facade, slots, workers, tuner) {
            Ok(()) => {
                facade.running = true;
                Ok(())
            }
            Err(err) => {
                logging::error!(self.core.log, "initialization failed"; "error" => %err);
                let _ = self.do_shutdown(&mut facade);
                Err(err)
            }
        }
    }

    fn do_initialize(
        &self,
        facade: &mut Facade,
        slots: usize,
        workers: usize,
        tuner: Option<Arc<dyn Tuner>>,
    ) -> Result<()> {
        self.core.setup_counters(slots);
        self.core.slots.store(slots, Ordering::Relaxed);
        self.core.workers.store(workers, Ordering::Relaxed);
        self.core.max_incoming.store(
            facade.configure.maximum_incoming_connections,
            Ordering::Relaxed,
        );
        facade.workers = workers;

        let incoming_timeouts = facade.configure.incoming_timeouts();
        let outgoing_timeouts = facade.configure.outgoing_timeouts();

        // Build every reactor before spawning anything, so descriptor
        // failures abort while still single-threaded.
        let mut reactors = Vec::with_capacity(slots);
        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            let mut attached = Vec::with_capacity(facade.listeners.len());
            for listener in &facade.listeners {
                attached.push(listener.clone_for_reactor()?);
            }

            let (reactor, handle) = Reactor::new(
                slot,
                self.core.clone(),
                attached,
                incoming_timeouts,
                outgoing_timeouts,
                tuner.clone(),
                &self.core.log,
            )?;
            reactors.push(reactor);
            handles.push(handle);
        }

        *self.core.handles.lock() = handles;

        for (after, repeat, task) in facade.staged_timers.drain(..) {
            self.core.register_timer(after, repeat, task)?;
        }

        for (slot, reactor) in reactors.into_iter().enumerate() {
            let thread = thread::Builder::new()
                .name(format!("reactor-{}", slot))
                .spawn(move || reactor.run())?;
            facade.threads.push(thread);
        }

        for index in 0..workers {
            let core = self.core.clone();
            let tuner = tuner.clone();
            let thread = thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || {
                    let log = core.log.new(logging::o!("worker" => index));
                    jobs::worker_loop(&core.jobs, tuner.as_ref(), &log);
                })?;
            facade.threads.push(thread);
        }

        Ok(())
    }

    /// Allocates an outgoing channel to `host:port` and starts connecting.
    /// The channel survives disconnections: a later `send` reconnects from
    /// the retained metadata until `forget` is called.
    pub fn connect_tcp4(
        &self,
        host: &str,
        port: u16,
        handler: Arc<dyn Handler>,
        slot: Option<usize>,
    ) -> Result<Channel> {
        self.do_connect(host, port, HandlerSource::Shared(handler), None, slot)
    }

    /// Outgoing TLS connection.
    pub fn ssl_connect_tcp4(
        &self,
        host: &str,
        port: u16,
        tls: &TlsContext,
        handler: Arc<dyn Handler>,
        slot: Option<usize>,
    ) -> Result<Channel> {
        self.do_connect(
            host,
            port,
            HandlerSource::Shared(handler),
            Some(tls.clone()),
            slot,
        )
    }

    /// Outgoing connection with a per-channel handler from the factory. The
    /// produced handler lives until the channel is forgotten.
    pub fn connect_tcp4_with_factory(
        &self,
        host: &str,
        port: u16,
        factory: Arc<dyn HandlerFactory>,
        slot: Option<usize>,
    ) -> Result<Channel> {
        self.do_connect(host, port, HandlerSource::Factory(factory), None, slot)
    }

    pub fn ssl_connect_tcp4_with_factory(
        &self,
        host: &str,
        port: u16,
        tls: &TlsContext,
        factory: Arc<dyn HandlerFactory>,
        slot: Option<usize>,
    ) -> Result<Channel> {
        self.do_connect(
            host,
            port,
            HandlerSource::Factory(factory),
            Some(tls.clone()),
            slot,
        )
    }

    fn do_connect(
        &self,
        host: &str,
        port: u16,
        source: HandlerSource,
        tls: Option<TlsContext>,
        slot: Option<usize>,
    ) -> Result<Channel> {
        let slots = self.core.handles.lock().len();
        assert!(slots > 0, "connect must follow initialize");

        let slot = match slot {
            Some(slot) if slot < slots => slot,
            _ => rand::thread_rng().gen_range(0..slots),
        };

        let ip = resolver::global()
            .resolve(host, ResolvePolicy::Random, resolver::DEFAULT_TTL)
            .ok_or_else(|| Error::Resolve(host.to_string()))?;

        let channel = self.core.allocate_channel(slot, true);
        let info = Arc::new(OutgoingInfo {
            host: host.to_string(),
            port,
            handler: source.produce(),
            tls,
        });

        let command = match socket::connect_tcp4(ip, port) {
            Ok(pending) => Command::Attach {
                channel,
                pending,
                info,
            },
            // A synchronous refusal still allocates the channel: the failure
            // is reported through on_error and a later send retries, exactly
            // like an asynchronous one.
            Err(error) if connectivity_error(&error) => Command::AttachFailed {
                channel,
                info,
                error,
            },
            Err(error) => return Err(error.into()),
        };

        let handle = {
            let handles = self.core.handles.lock();
            match handles.get(slot) {
                Some(handle) => handle.clone(),
                None => return Err(Error::State("server not running")),
            }
        };
        handle.command(command)?;

        Ok(channel)
    }

    /// Sends bytes on a channel, from any thread. Messages to vanished
    /// incoming channels are silently dropped; vanished outgoing channels
    /// are reconnected first.
    pub fn send(&self, channel: Channel, data: &[u8]) -> Result<()> {
        self.core.send(channel, data)
    }

    /// Disconnects a channel, from any thread. With `finish_write`, queued
    /// bytes are flushed before the connection closes.
    pub fn disconnect(&self, channel: Channel, finish_write: bool) -> Result<()> {
        self.core.disconnect(channel, finish_write)
    }

    /// Drops the reconnect metadata of an outgoing channel. A live
    /// connection stays up until it closes naturally. Calling this twice is
    /// a no-op.
    pub fn forget(&self, channel: Channel) {
        self.core.forget(channel)
    }

    /// Registers a timer on one of the reactor threads. Before
    /// `initialize`, timers are staged and armed during initialization.
    pub fn register_timer<F>(
        &self,
        after: Duration,
        repeat: Option<Duration>,
        task: F,
    ) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let mut facade = self.state.lock();
        if !facade.running {
            facade.staged_timers.push((after, repeat, Box::new(task)));
            return Ok(());
        }
        drop(facade);

        self.core.register_timer(after, repeat, Box::new(task))
    }

    /// Stops every reactor and worker thread, closes all connections and
    /// listeners, and joins the threads. Idempotent. Channel counters are
    /// preserved so a re-initialized server never reissues a channel.
    pub fn shutdown(&self) -> Result<()> {
        let mut facade = self.state.lock();
        self.do_shutdown(&mut facade)
    }

    fn do_shutdown(&self, facade: &mut Facade) -> Result<()> {
        if !facade.running && facade.threads.is_empty() && facade.listeners.is_empty() {
            return Ok(());
        }

        logging::debug!(self.core.log, "shutting down");

        self.core.jobs.dump();
        for _ in 0..facade.workers {
            self.core.jobs.push(None);
        }

        {
            let handles = self.core.handles.lock();
            for handle in handles.iter() {
                let _ = handle.command(Command::Shutdown);
            }
        }

        for thread in facade.threads.drain(..) {
            let _ = thread.join();
        }

        self.core.handles.lock().clear();
        self.core.jobs.dump();
        self.core.workers.store(0, Ordering::Relaxed);
        self.core.incoming.store(0, Ordering::Relaxed);

        facade.listeners.clear();
        facade.staged_timers.clear();
        facade.workers = 0;
        facade.running = false;

        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Failures of the connection attempt itself, as opposed to local resource
/// or addressing problems.
fn connectivity_error(error: &std::io::Error) -> bool {
    match error.kind() {
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::TimedOut => true,
        _ => matches!(
            error.raw_os_error(),
            Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Framing;
    use crate::{is_outgoing, slot_of};

    struct Nop;

    impl Handler for Nop {
        fn message_length(&self, _: &ConnContext, data: &[u8]) -> Framing {
            Framing::Frame(data.len().max(1))
        }

        fn on_message(&self, _: &ConnContext, _: &[u8]) -> Verdict {
            Verdict::Continue
        }
    }

    #[test]
    fn test_configure_defaults() {
        let configure = Configure::default();

        assert_eq!(configure.incoming_receive_timeout, Duration::from_secs(5));
        assert_eq!(configure.outgoing_connect_timeout, Duration::from_secs(5));
        assert_eq!(configure.incoming_idle_timeout, Duration::from_secs(60));
        assert_eq!(configure.maximum_incoming_connections, 50000);
    }

    #[test]
    fn test_channel_allocation_is_slot_stable() {
        let core = ServerCore::new(crate::logging::discard());
        core.setup_counters(4);
        core.slots.store(4, Ordering::Relaxed);

        let mut seen = std::collections::HashSet::new();
        for slot in 0..4 {
            for _ in 0..16 {
                let incoming = core.allocate_channel(slot, false);
                let outgoing = core.allocate_channel(slot, true);

                assert_ne!(incoming, INVALID_CHANNEL);
                assert!(!is_outgoing(incoming));
                assert!(is_outgoing(outgoing));
                assert_eq!(slot_of(incoming, 4), slot);
                assert_eq!(slot_of(outgoing, 4), slot);

                assert!(seen.insert(incoming));
                assert!(seen.insert(outgoing));
            }
        }
    }

    #[test]
    fn test_counters_survive_restart() {
        let core = ServerCore::new(crate::logging::discard());
        core.setup_counters(4);
        core.slots.store(4, Ordering::Relaxed);

        let mut issued = Vec::new();
        for slot in 0..4 {
            issued.push(core.allocate_channel(slot, false));
        }

        // Same slot count: counters keep running.
        core.setup_counters(4);
        let next = core.allocate_channel(0, false);
        assert!(issued.iter().all(|&channel| next > channel));
        assert!(!issued.contains(&next));

        // Different slot count: everything restarts above the high mark.
        core.setup_counters(3);
        core.slots.store(3, Ordering::Relaxed);
        let highest = issued.iter().copied().max().unwrap();
        for slot in 0..3 {
            let channel = core.allocate_channel(slot, false);
            assert!(channel > highest);
            assert_eq!(slot_of(channel, 3), slot);
        }
    }

    #[test]
    fn test_incoming_admission_limit() {
        let core = ServerCore::new(crate::logging::discard());
        core.max_incoming.store(2, Ordering::Relaxed);

        assert!(core.try_admit_incoming());
        assert!(core.try_admit_incoming());
        assert!(!core.try_admit_incoming());

        core.release_incoming();
        assert!(core.try_admit_incoming());
    }

    #[test]
    fn test_initialize_validates_thread_counts() {
        let server = Server::new(None);

        assert!(matches!(server.initialize(0, 1, None), Err(Error::Config(_))));
        assert!(matches!(
            server.initialize(MAXIMUM_SLOTS + 1, 1, None),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            server.initialize(1, MAXIMUM_WORKERS + 1, None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_lifecycle_and_idempotent_shutdown() {
        let server = Server::new(None);
        server.listen(0, Arc::new(Nop)).unwrap();
        server.initialize(2, 2, None).unwrap();

        assert!(matches!(
            server.initialize(2, 2, None),
            Err(Error::State(_))
        ));

        server.shutdown().unwrap();
        server.shutdown().unwrap();
    }

    #[test]
    fn test_operations_require_running_server() {
        let server = Server::new(None);

        assert!(server.send(12345, b"x").is_err());
        assert!(server.disconnect(12345, true).is_err());
        assert!(server.send(INVALID_CHANNEL, b"x").is_err());
    }
}
