//! The contracts between the framework and the application: message framing,
//! message handling, connection lifecycle hooks and the per-connection
//! context handed to every callback.

use std::any::Any;
use std::io;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::server::ServerCore;
use crate::socket::Address;
use crate::tls::TlsPeer;
use crate::{Channel, Result};

/// Answer to "how many bytes constitute the next message?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Not enough bytes to tell yet, keep receiving.
    Pending,
    /// The next message spans this many bytes from the buffer head.
    Frame(usize),
    /// The byte stream is not a valid protocol stream; drop the connection.
    Malformed,
}

/// Handler's verdict after one complete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the connection going.
    Continue,
    /// Hang up gracefully once the send buffer drains.
    Finish,
    /// Drop the connection immediately.
    Abort,
}

/// Which direction an I/O failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Application-side connection protocol.
///
/// `message_length` and the connection hooks run on reactor threads and must
/// not block; `on_message` runs on a job worker when the pool is non-empty,
/// inline on the reactor otherwise.
pub trait Handler: Send + Sync {
    /// Called whenever bytes arrive and no frame length is pending.
    fn message_length(&self, context: &ConnContext, data: &[u8]) -> Framing;

    /// Called once per complete message.
    fn on_message(&self, context: &ConnContext, data: &[u8]) -> Verdict;

    /// Post-connect (and for TLS, post-handshake) hook. Returning false drops
    /// the connection.
    fn on_connected(&self, _context: &ConnContext) -> bool {
        true
    }

    /// Called exactly once per connection, after it is torn down.
    fn on_disconnected(&self, _context: &ConnContext) {}

    /// Diagnostic hook preceding `on_disconnected` on failures.
    fn on_error(&self, _context: &ConnContext, _direction: Direction, _error: &io::Error) {}
}

/// Produces one handler per connection, for protocols that keep per-channel
/// state inside the handler itself.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Handler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Arc<dyn Handler> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Handler> {
        self()
    }
}

/// Thread lifecycle hooks, e.g. for per-thread TLS or allocator setup.
pub trait Tuner: Send + Sync {
    fn on_io_thread_initialize(&self) -> bool {
        true
    }

    fn on_io_thread_shutdown(&self) {}

    fn on_job_thread_initialize(&self) -> bool {
        true
    }

    fn on_job_thread_shutdown(&self) {}
}

/// Where connection handlers come from: one shared instance, or a factory
/// invoked per connection.
#[derive(Clone)]
pub(crate) enum HandlerSource {
    Shared(Arc<dyn Handler>),
    Factory(Arc<dyn HandlerFactory>),
}

impl HandlerSource {
    #[inline]
    pub(crate) fn produce(&self) -> Arc<dyn Handler> {
        match self {
            HandlerSource::Shared(handler) => handler.clone(),
            HandlerSource::Factory(factory) => factory.create(),
        }
    }
}

/// Per-connection context handed to every handler callback. Reference
/// counted: jobs queued to workers keep the channel identity alive even after
/// the connection itself is gone.
pub struct ConnContext {
    channel: Channel,
    me: Address,
    peer: Address,
    tls_peer: OnceLock<TlsPeer>,
    attachment: Mutex<Option<Box<dyn Any + Send>>>,
    server: Weak<ServerCore>,
}

impl ConnContext {
    pub(crate) fn new(
        channel: Channel,
        me: Address,
        peer: Address,
        server: Weak<ServerCore>,
    ) -> Arc<ConnContext> {
        Arc::new(ConnContext {
            channel,
            me,
            peer,
            tls_peer: OnceLock::new(),
            attachment: Mutex::new(None),
            server,
        })
    }

    #[inline]
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Local address of the connection.
    #[inline]
    pub fn me(&self) -> &Address {
        &self.me
    }

    /// Remote address of the connection.
    #[inline]
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// TLS peer identity, available from `on_connected` onwards on
    /// authenticated connections.
    #[inline]
    pub fn tls_peer(&self) -> Option<&TlsPeer> {
        self.tls_peer.get()
    }

    pub(crate) fn set_tls_peer(&self, peer: TlsPeer) {
        let _ = self.tls_peer.set(peer);
    }

    /// Associates an opaque payload with this connection, returning the
    /// previous one.
    pub fn set_attachment(&self, attachment: Box<dyn Any + Send>) -> Option<Box<dyn Any + Send>> {
        self.attachment.lock().replace(attachment)
    }

    /// Removes and returns the attachment.
    pub fn take_attachment(&self) -> Option<Box<dyn Any + Send>> {
        self.attachment.lock().take()
    }

    /// Sends bytes on this channel, from any thread.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        match self.server.upgrade() {
            Some(core) => core.send(self.channel, data),
            None => Err(crate::Error::State("server is gone")),
        }
    }

    /// Disconnects this channel, from any thread.
    pub fn disconnect(&self, finish_write: bool) -> Result<()> {
        match self.server.upgrade() {
            Some(core) => core.disconnect(self.channel, finish_write),
            None => Err(crate::Error::State("server is gone")),
        }
    }

    /// Drops the reconnect metadata of this (outgoing) channel.
    pub fn forget(&self) {
        if let Some(core) = self.server.upgrade() {
            core.forget(self.channel);
        }
    }
}
