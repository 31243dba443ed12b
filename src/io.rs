//! Byte-level I/O abstraction with a status/next-action protocol. The
//! per-connection state machine drives implementations through `read`,
//! `write` and the `accept`/`connect`/`shutdown` transitions; `WantRead` and
//! `WantWrite` tell it which readiness event unblocks the operation.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::{Registry, Token};

use crate::socket::{ConnectProbe, StreamSocket};

/// Outcome of one I/O step.
#[derive(Debug)]
pub enum IoStatus {
    /// Action completed successfully.
    Ok,
    /// Internal inconsistency; the connection must be dropped.
    Bug,
    /// Action failed with an OS or protocol error.
    Error(io::Error),
    /// Downstream refused more data for now.
    Jammed,
    /// Peer closed the connection.
    Closed,
    /// Action incomplete, retry when the socket is readable.
    WantRead,
    /// Action incomplete, retry when the socket is writable.
    WantWrite,
}

/// State-machine transitions an [`Io`] can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    None,
    Read,
    Write,
    Accept,
    Connect,
    Shutdown,
}

/// What to do right after a connection attaches to its reactor.
#[derive(Debug, Clone, Copy)]
pub struct IoPrologue {
    /// Executed immediately on attach.
    pub immediate: IoAction,
    /// Executed on the next readiness event.
    pub next: IoAction,
    pub wants_read: bool,
    pub wants_write: bool,
}

pub trait Io: Send {
    fn prologue(&mut self) -> IoPrologue;

    /// Reads into `buf`, returning the status and the number of bytes
    /// consumed.
    fn read(&mut self, buf: &mut [u8]) -> (IoStatus, usize);

    /// Writes out of `buf`, returning the status and the number of bytes
    /// produced.
    fn write(&mut self, buf: &[u8]) -> (IoStatus, usize);

    fn accept(&mut self) -> IoStatus;
    fn connect(&mut self) -> IoStatus;
    fn shutdown(&mut self) -> IoStatus;

    /// Registers the underlying socket on a reactor poll.
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Peer identity, for transports that authenticate the remote end.
    fn tls_peer(&self) -> Option<crate::tls::TlsPeer> {
        None
    }
}

/// Clear-text socket backend. Accepted sockets are readable right away;
/// outgoing sockets first finish the kernel-level connect.
pub struct PlainIo {
    stream: StreamSocket,
    connecting: bool,
}

impl PlainIo {
    #[inline]
    pub(crate) fn new(stream: StreamSocket, connecting: bool) -> PlainIo {
        PlainIo { stream, connecting }
    }
}

impl Io for PlainIo {
    fn prologue(&mut self) -> IoPrologue {
        if self.connecting {
            IoPrologue {
                immediate: IoAction::Connect,
                next: IoAction::None,
                wants_read: false,
                wants_write: true,
            }
        } else {
            IoPrologue {
                immediate: IoAction::None,
                next: IoAction::None,
                wants_read: true,
                wants_write: false,
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> (IoStatus, usize) {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return (IoStatus::Closed, 0),
                Ok(n) => return (IoStatus::Ok, n),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return (IoStatus::WantRead, 0)
                }
                Err(err) => return (IoStatus::Error(err), 0),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> (IoStatus, usize) {
        loop {
            match self.stream.write(buf) {
                Ok(0) => {
                    return (IoStatus::Error(io::ErrorKind::WriteZero.into()), 0);
                }
                Ok(n) => return (IoStatus::Ok, n),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return (IoStatus::WantWrite, 0)
                }
                Err(ref err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    return (IoStatus::Closed, 0)
                }
                Err(err) => return (IoStatus::Error(err), 0),
            }
        }
    }

    fn accept(&mut self) -> IoStatus {
        IoStatus::Ok
    }

    fn connect(&mut self) -> IoStatus {
        if !self.connecting {
            return IoStatus::Ok;
        }

        match self.stream.probe_connect() {
            ConnectProbe::Connected => {
                self.connecting = false;
                IoStatus::Ok
            }
            ConnectProbe::Pending => IoStatus::WantWrite,
            ConnectProbe::Failed(err) => IoStatus::Error(err),
        }
    }

    fn shutdown(&mut self) -> IoStatus {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => IoStatus::Ok,
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => IoStatus::Ok,
            Err(err) => IoStatus::Error(err),
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.stream,
            token,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        )
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::StreamSocket;
    use mio::net::UnixStream;

    fn pair() -> (PlainIo, PlainIo) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            PlainIo::new(StreamSocket::Unix(a), false),
            PlainIo::new(StreamSocket::Unix(b), false),
        )
    }

    #[test]
    fn test_read_want_read_when_empty() {
        let (mut a, _b) = pair();
        let mut buf = [0u8; 16];

        assert!(matches!(a.read(&mut buf), (IoStatus::WantRead, 0)));
    }

    #[test]
    fn test_write_then_read() {
        let (mut a, mut b) = pair();
        let mut buf = [0u8; 16];

        assert!(matches!(a.write(b"ping"), (IoStatus::Ok, 4)));

        let (status, n) = b.read(&mut buf);
        assert!(matches!(status, IoStatus::Ok));
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_read_closed_on_peer_drop() {
        let (mut a, b) = pair();
        drop(b);

        let mut buf = [0u8; 16];
        assert!(matches!(a.read(&mut buf), (IoStatus::Closed, 0)));
    }

    #[test]
    fn test_accepted_prologue_reads_first() {
        let (mut a, _b) = pair();
        let prologue = a.prologue();

        assert_eq!(prologue.immediate, IoAction::None);
        assert!(prologue.wants_read);
        assert!(!prologue.wants_write);
    }
}
