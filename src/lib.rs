//! `trellis` is an embeddable framework for building high-throughput,
//! connection-oriented TCP services. A fixed set of reactor threads
//! multiplexes all sockets, an optional pool of job workers executes message
//! handlers, and a [`Server`](server::Server) façade exposes thread-safe
//! `send`/`disconnect`/`shutdown` operations keyed by opaque channel ids.
//!
//! Connections may run in the clear or wrapped in TLS; in either case the
//! application only supplies a [`Handler`](handler::Handler) that tells the
//! framework where message boundaries are and what to do with each message.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod error;
pub mod handler;
pub mod io;
pub mod logging;
pub mod resolver;
pub mod server;
pub mod socket;
pub mod tls;

mod conn;
mod jobs;
mod listener;
mod reactor;

/// Opaque identifier of one logical connection. The high bit distinguishes
/// outgoing channels; the remaining bits encode the owning reactor slot and a
/// monotonic per-slot counter. `0` is never allocated.
pub type Channel = u64;

/// The reserved invalid channel value.
pub const INVALID_CHANNEL: Channel = 0;

pub(crate) const OUTGOING_BIT: Channel = 1 << 63;

/// Whether a channel was allocated for an outgoing connection.
#[inline]
pub fn is_outgoing(channel: Channel) -> bool {
    channel & OUTGOING_BIT != 0
}

/// The reactor slot a channel is pinned to, stable for the channel's lifetime.
#[inline]
pub fn slot_of(channel: Channel, slots: usize) -> usize {
    ((channel & !OUTGOING_BIT) % slots as Channel) as usize
}

pub use crate::error::{Error, Result};
pub use crate::handler::{ConnContext, Direction, Framing, Handler, HandlerFactory, Tuner, Verdict};
pub use crate::resolver::{ResolvePolicy, Resolver};
pub use crate::server::{Configure, Server};
pub use crate::socket::Address;
pub use crate::tls::{TicketKey, TlsContext, TlsOptions, TlsPeer};
