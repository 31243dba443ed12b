//! Shared scaffolding for the loopback scenarios: recording handlers and a
//! small deadline-polling helper.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;

use trellis::{ConnContext, Direction, Framing, Handler, TlsPeer, Verdict};

/// Everything a scenario may want to assert on afterwards.
#[derive(Default)]
pub struct Events {
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub messages: Mutex<Vec<Vec<u8>>>,
    pub errors: Mutex<Vec<(Direction, io::ErrorKind)>>,
    pub tls_peers: Mutex<Vec<TlsPeer>>,
}

impl Events {
    pub fn new() -> Arc<Events> {
        Arc::new(Events::default())
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    /// All received payload bytes, concatenated in arrival order.
    pub fn received(&self) -> Vec<u8> {
        self.messages.lock().concat()
    }
}

/// How a recording handler frames and reacts to messages.
pub enum Mode {
    /// Frame on whatever is buffered and echo it back.
    Echo,
    /// Frame on `\r\n`; `quit\r\n` asks for a graceful close.
    Lines,
    /// Big-endian u32 length header before each payload; echoes the frame.
    Prefixed,
    /// Frame on whatever is buffered, record it, stay silent.
    Record,
}

/// Wraps a payload in the length-prefixed wire format of `Mode::Prefixed`.
pub fn prefixed(payload: &[u8]) -> Vec<u8> {
    let mut framed = vec![0u8; 4];
    BigEndian::write_u32(&mut framed, payload.len() as u32);
    framed.extend_from_slice(payload);
    framed
}

pub struct Recording {
    pub events: Arc<Events>,
    pub mode: Mode,
}

impl Recording {
    pub fn new(mode: Mode) -> (Arc<Recording>, Arc<Events>) {
        let events = Events::new();
        let handler = Arc::new(Recording {
            events: events.clone(),
            mode,
        });
        (handler, events)
    }
}

impl Handler for Recording {
    fn message_length(&self, _: &ConnContext, data: &[u8]) -> Framing {
        match self.mode {
            Mode::Echo | Mode::Record => Framing::Frame(data.len()),
            Mode::Lines => match data.windows(2).position(|pair| pair == b"\r\n") {
                Some(position) => Framing::Frame(position + 2),
                None => Framing::Pending,
            },
            Mode::Prefixed => {
                if data.len() < 4 {
                    return Framing::Pending;
                }
                Framing::Frame(4 + BigEndian::read_u32(data) as usize)
            }
        }
    }

    fn on_message(&self, context: &ConnContext, data: &[u8]) -> Verdict {
        match self.mode {
            Mode::Prefixed => self.events.messages.lock().push(data[4..].to_vec()),
            _ => self.events.messages.lock().push(data.to_vec()),
        }

        match self.mode {
            Mode::Echo | Mode::Prefixed => {
                context.send(data).expect("echo send");
                Verdict::Continue
            }
            Mode::Lines if data == b"quit\r\n" => Verdict::Finish,
            Mode::Lines | Mode::Record => Verdict::Continue,
        }
    }

    fn on_connected(&self, context: &ConnContext) -> bool {
        if let Some(peer) = context.tls_peer() {
            self.events.tls_peers.lock().push(peer.clone());
        }
        self.events.connected.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_disconnected(&self, _: &ConnContext) {
        self.events.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _: &ConnContext, direction: Direction, error: &io::Error) {
        self.events.errors.lock().push((direction, error.kind()));
    }
}

/// Polls `condition` until it holds or the deadline passes.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
