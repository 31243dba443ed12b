use std::fmt;
use std::io;
use std::net;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the framework.
///
/// `Busy` is the only transient variant: the operation could not complete
/// right now and will be retried on the next event. Everything else either
/// fails the call or tears the connection down.
#[derive(Debug)]
pub enum Error {
    /// Retry on the next readiness event.
    Busy,
    /// The façade was used outside its state contract.
    State(&'static str),
    /// Invalid configuration (slot/worker counts, TLS material, addresses).
    Config(String),
    /// The hostname did not resolve to a usable address.
    Resolve(String),
    /// TLS engine failure outside an I/O event.
    Tls(openssl::error::ErrorStack),
    /// Underlying socket failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Busy => write!(f, "resource busy, retry"),
            Error::State(what) => write!(f, "invalid call: {}", what),
            Error::Config(what) => write!(f, "invalid configuration: {}", what),
            Error::Resolve(host) => write!(f, "cannot resolve [{}]", host),
            Error::Tls(stack) => write!(f, "tls failure: {}", stack),
            Error::Io(err) => write!(f, "i/o failure: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Tls(stack) => Some(stack),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Error::Busy,
            _ => Error::Io(err),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    #[inline]
    fn from(stack: openssl::error::ErrorStack) -> Self {
        Error::Tls(stack)
    }
}

impl From<net::AddrParseError> for Error {
    #[inline]
    fn from(err: net::AddrParseError) -> Self {
        Error::Config(err.to_string())
    }
}
