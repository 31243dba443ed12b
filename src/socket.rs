//! Non-blocking socket plumbing: listening sockets, accepted streams and
//! outgoing connects, for both TCP (v4/v6) and Unix domain sockets. All
//! descriptors are created non-blocking and close-on-exec; failures carry the
//! underlying OS error.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener as StdTcpListener};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

const LISTEN_BACKLOG: i32 = 256;

/// Address of one endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet(SocketAddr),
    Unix(String),
}

impl Address {
    /// Placeholder used before an outgoing socket has a bound local address.
    #[inline]
    pub(crate) fn unspecified() -> Address {
        Address::Inet(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    /// The TCP address, if this endpoint is an internet socket.
    #[inline]
    pub fn inet(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(addr) => Some(*addr),
            Address::Unix(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => write!(f, "{}", addr),
            Address::Unix(name) if name.is_empty() => write!(f, "unix:<unnamed>"),
            Address::Unix(name) => write!(f, "unix:{}", name),
        }
    }
}

/// A bound-and-listening socket, kept in blocking-API form so it can be
/// cloned into every reactor.
pub(crate) enum ListenSocket {
    Tcp(StdTcpListener),
    Unix(StdUnixListener),
}

impl ListenSocket {
    pub(crate) fn local_address(&self) -> io::Result<Address> {
        match self {
            ListenSocket::Tcp(listener) => Ok(Address::Inet(listener.local_addr()?)),
            ListenSocket::Unix(listener) => {
                let addr = listener.local_addr()?;
                Ok(unix_address(addr.as_pathname()))
            }
        }
    }

    /// Duplicates the descriptor for registration on one reactor's poll.
    pub(crate) fn clone_for_reactor(&self) -> io::Result<ReactorListener> {
        match self {
            ListenSocket::Tcp(listener) => {
                Ok(ReactorListener::Tcp(TcpListener::from_std(listener.try_clone()?)))
            }
            ListenSocket::Unix(listener) => {
                Ok(ReactorListener::Unix(UnixListener::from_std(listener.try_clone()?)))
            }
        }
    }
}

/// Per-reactor clone of a listening socket, registered with that reactor's
/// poll.
pub(crate) enum ReactorListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Source for ReactorListener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            ReactorListener::Tcp(listener) => listener.register(registry, token, interests),
            ReactorListener::Unix(listener) => listener.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            ReactorListener::Tcp(listener) => listener.reregister(registry, token, interests),
            ReactorListener::Unix(listener) => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            ReactorListener::Tcp(listener) => listener.deregister(registry),
            ReactorListener::Unix(listener) => listener.deregister(registry),
        }
    }
}

/// One accepted or connected stream.
pub(crate) enum StreamSocket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl StreamSocket {
    pub(crate) fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(stream) => stream.shutdown(how),
            StreamSocket::Unix(stream) => stream.shutdown(how),
        }
    }

    /// Post-`connect` probe, valid once the socket reported writable.
    pub(crate) fn probe_connect(&self) -> ConnectProbe {
        let taken = match self {
            StreamSocket::Tcp(stream) => stream.take_error(),
            StreamSocket::Unix(stream) => stream.take_error(),
        };

        match taken {
            Ok(Some(err)) => return ConnectProbe::Failed(err),
            Err(err) => return ConnectProbe::Failed(err),
            Ok(None) => {}
        }

        let connected = match self {
            StreamSocket::Tcp(stream) => stream.peer_addr().map(|_| ()),
            StreamSocket::Unix(stream) => stream.peer_addr().map(|_| ()),
        };

        match connected {
            Ok(()) => ConnectProbe::Connected,
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => ConnectProbe::Pending,
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => ConnectProbe::Pending,
            Err(err) => ConnectProbe::Failed(err),
        }
    }
}

impl Read for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(stream) => stream.read(buf),
            StreamSocket::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for StreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(stream) => stream.write(buf),
            StreamSocket::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(stream) => stream.flush(),
            StreamSocket::Unix(stream) => stream.flush(),
        }
    }
}

impl Source for StreamSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(stream) => stream.register(registry, token, interests),
            StreamSocket::Unix(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(stream) => stream.reregister(registry, token, interests),
            StreamSocket::Unix(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(stream) => stream.deregister(registry),
            StreamSocket::Unix(stream) => stream.deregister(registry),
        }
    }
}

/// Outcome of polling an in-progress connect.
pub(crate) enum ConnectProbe {
    Connected,
    Pending,
    Failed(io::Error),
}

/// An initiated outgoing connection, possibly still completing its socket
/// level handshake.
pub(crate) struct PendingConnect {
    pub stream: StreamSocket,
    pub peer: Address,
    pub local: Address,
    pub connecting: bool,
}

pub(crate) fn listen_tcp4(port: u16, loopback: bool) -> io::Result<ListenSocket> {
    let ip = if loopback { Ipv4Addr::LOCALHOST } else { Ipv4Addr::UNSPECIFIED };
    let addr = SocketAddr::from((ip, port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    prepare(&socket)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(ListenSocket::Tcp(socket.into()))
}

/// IPv6 listener; the any-interface variant also accepts IPv4-mapped
/// connections, the loopback variant cannot.
pub(crate) fn listen_tcp6(port: u16, loopback: bool) -> io::Result<ListenSocket> {
    let ip = if loopback { Ipv6Addr::LOCALHOST } else { Ipv6Addr::UNSPECIFIED };
    let addr = SocketAddr::from((ip, port));

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    prepare(&socket)?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(loopback)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(ListenSocket::Tcp(socket.into()))
}

/// Binds a Unix domain socket. File-based sockets get mode 0600 when
/// `privileged`, 0666 otherwise; abstract-namespace sockets ignore both.
pub(crate) fn listen_unix(path: &str, file_based: bool, privileged: bool) -> io::Result<ListenSocket> {
    if file_based {
        // A stale socket file from a previous run would make bind fail.
        let _ = fs::remove_file(path);

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        prepare(&socket)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(LISTEN_BACKLOG)?;

        let mode = if privileged { 0o600 } else { 0o666 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

        Ok(ListenSocket::Unix(socket.into()))
    } else {
        use std::os::linux::net::SocketAddrExt;

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(path.as_bytes())?;
        let listener = StdUnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;

        Ok(ListenSocket::Unix(listener))
    }
}

/// Accepts one connection. `Ok(None)` means a transient condition
/// (`EAGAIN`/`EINTR`/`ECONNABORTED`): come back on the next readiness event.
pub(crate) fn accept(listener: &ReactorListener) -> io::Result<Option<(StreamSocket, Address, Address)>> {
    match listener {
        ReactorListener::Tcp(listener) => match listener.accept() {
            Ok((stream, peer)) => {
                let local = Address::Inet(stream.local_addr()?);
                Ok(Some((StreamSocket::Tcp(stream), Address::Inet(peer), local)))
            }
            Err(err) if transient_accept(&err) => Ok(None),
            Err(err) => Err(err),
        },
        ReactorListener::Unix(listener) => match listener.accept() {
            Ok((stream, peer)) => {
                let local = stream
                    .local_addr()
                    .map(|addr| unix_address(addr.as_pathname()))
                    .unwrap_or_else(|_| Address::Unix(String::new()));
                Ok(Some((
                    StreamSocket::Unix(stream),
                    unix_address(peer.as_pathname()),
                    local,
                )))
            }
            Err(err) if transient_accept(&err) => Ok(None),
            Err(err) => Err(err),
        },
    }
}

/// Initiates a non-blocking IPv4 connect. `connecting` is true when the
/// kernel reported the handshake as in progress.
pub(crate) fn connect_tcp4(ip: Ipv4Addr, port: u16) -> io::Result<PendingConnect> {
    let peer = SocketAddr::from((ip, port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    prepare(&socket)?;
    socket.set_keepalive(true)?;

    let connecting = match socket.connect(&peer.into()) {
        Ok(()) => false,
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => true,
        Err(err) => return Err(err),
    };

    let stream: std::net::TcpStream = socket.into();
    let local = stream
        .local_addr()
        .map(Address::Inet)
        .unwrap_or_else(|_| Address::unspecified());

    Ok(PendingConnect {
        stream: StreamSocket::Tcp(TcpStream::from_std(stream)),
        peer: Address::Inet(peer),
        local,
        connecting,
    })
}

#[inline]
fn prepare(socket: &Socket) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)
}

#[inline]
fn transient_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}

fn unix_address(path: Option<&Path>) -> Address {
    match path {
        Some(path) => Address::Unix(path.to_string_lossy().into_owned()),
        None => Address::Unix(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_tcp4_binds_ephemeral() {
        let listener = listen_tcp4(0, true).unwrap();
        let address = listener.local_address().unwrap();

        let addr = address.inet().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_listen_unix_file_modes() {
        let path = std::env::temp_dir().join(format!("trellis-sock-{}", std::process::id()));
        let path = path.to_str().unwrap().to_string();

        let listener = listen_unix(&path, true, true).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(listener);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_accept_reports_transient_when_idle() {
        let listener = listen_tcp4(0, true).unwrap();
        let reactor_side = listener.clone_for_reactor().unwrap();

        // Nothing connected yet, must not error out.
        assert!(accept(&reactor_side).unwrap().is_none());
    }

    #[test]
    fn test_connect_probe_reaches_listener() {
        let listener = listen_tcp4(0, true).unwrap();
        let addr = listener.local_address().unwrap().inet().unwrap();

        let pending = connect_tcp4(Ipv4Addr::LOCALHOST, addr.port()).unwrap();

        // Loopback connects settle quickly; poll the probe briefly.
        let mut connected = !pending.connecting;
        for _ in 0..50 {
            if connected {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            match pending.stream.probe_connect() {
                ConnectProbe::Connected => connected = true,
                ConnectProbe::Pending => {}
                ConnectProbe::Failed(err) => panic!("connect failed: {}", err),
            }
        }

        assert!(connected);
    }

    #[test]
    fn test_address_display() {
        let addr = Address::Inet("127.0.0.1:80".parse().unwrap());
        assert_eq!(addr.to_string(), "127.0.0.1:80");

        assert_eq!(Address::Unix(String::new()).to_string(), "unix:<unnamed>");
        assert_eq!(Address::Unix("/tmp/x".into()).to_string(), "unix:/tmp/x");
    }
}
