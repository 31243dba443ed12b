//! Listening sockets. A listener is created before the reactors exist and is
//! later attached to every one of them by duplicating its descriptor, so all
//! reactors accept from the same queue.

use std::io;

use std::sync::Arc;

use crate::handler::HandlerSource;
use crate::logging::{self, Logger};
use crate::socket::{self, Address, ListenSocket, ReactorListener};
use crate::tls::TlsContext;

/// What newly accepted connections on one listener get: their handler source
/// and, for TLS listeners, the shared engine context.
pub(crate) struct Binding {
    pub source: HandlerSource,
    pub tls: Option<TlsContext>,
}

pub(crate) struct Listener {
    socket: ListenSocket,
    binding: Arc<Binding>,
    local: Address,
    // Socket file to unlink when the listener goes away.
    cleanup_path: Option<String>,
    log: Logger,
}

impl Listener {
    pub(crate) fn tcp(
        port: u16,
        loopback: bool,
        binding: Binding,
        log: &Logger,
    ) -> io::Result<Listener> {
        let socket = socket::listen_tcp4(port, loopback)?;
        let local = socket.local_address()?;

        let log = log.new(logging::o!("listener" => local.to_string()));
        logging::debug!(log, "listening");

        Ok(Listener {
            socket,
            binding: Arc::new(binding),
            local,
            cleanup_path: None,
            log,
        })
    }

    pub(crate) fn tcp6(
        port: u16,
        loopback: bool,
        binding: Binding,
        log: &Logger,
    ) -> io::Result<Listener> {
        let socket = socket::listen_tcp6(port, loopback)?;
        let local = socket.local_address()?;

        let log = log.new(logging::o!("listener" => local.to_string()));
        logging::debug!(log, "listening");

        Ok(Listener {
            socket,
            binding: Arc::new(binding),
            local,
            cleanup_path: None,
            log,
        })
    }

    pub(crate) fn unix(
        path: &str,
        file_based: bool,
        privileged: bool,
        binding: Binding,
        log: &Logger,
    ) -> io::Result<Listener> {
        let socket = socket::listen_unix(path, file_based, privileged)?;
        let local = socket.local_address()?;

        let log = log.new(logging::o!("listener" => local.to_string()));
        logging::debug!(log, "listening");

        Ok(Listener {
            socket,
            binding: Arc::new(binding),
            local,
            cleanup_path: if file_based { Some(path.to_string()) } else { None },
            log,
        })
    }

    #[inline]
    pub(crate) fn local(&self) -> &Address {
        &self.local
    }

    /// Duplicates the listening descriptor for one reactor.
    pub(crate) fn clone_for_reactor(&self) -> io::Result<(ReactorListener, Arc<Binding>)> {
        Ok((self.socket.clone_for_reactor()?, self.binding.clone()))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.cleanup_path {
            // Best effort: the file may already be gone or unlinkable.
            if std::fs::remove_file(path).is_err() {
                logging::debug!(self.log, "socket file not removed"; "path" => %path);
            }
        }
    }
}
