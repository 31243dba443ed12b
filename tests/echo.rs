//! Loopback scenarios over clear-text TCP: echo, delimiter framing,
//! handler-initiated graceful close and receive timeouts.

mod common;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use common::{prefixed, wait_until, Mode, Recording};
use trellis::{Configure, Server};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_echo_roundtrip() {
    let (handler, events) = Recording::new(Mode::Echo);

    let server = Server::new(None);
    let addr = server.listen(0, handler).unwrap();
    server.initialize(2, 2, None).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(b"hello").unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");

    drop(client);
    assert!(wait_until(WAIT, || events.disconnected() == 1));
    assert_eq!(events.connected(), 1);

    server.shutdown().unwrap();
}

#[test]
fn test_echo_inline_without_workers() {
    let (handler, events) = Recording::new(Mode::Echo);

    let server = Server::new(None);
    let addr = server.listen(0, handler).unwrap();
    server.initialize(1, 0, None).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(b"inline").unwrap();

    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"inline");

    drop(client);
    assert!(wait_until(WAIT, || events.disconnected() == 1));

    server.shutdown().unwrap();
}

#[test]
fn test_delimiter_framing_discards_partial_tail() {
    let (handler, events) = Recording::new(Mode::Lines);

    let server = Server::new(None);
    let addr = server.listen(0, handler).unwrap();
    server.initialize(2, 2, None).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    client.write_all(b"123\r\n456\r\n78").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    assert!(wait_until(WAIT, || {
        events.disconnected() == 1 && events.message_count() == 2
    }));

    let messages = events.messages.lock().clone();
    assert_eq!(messages, vec![b"123\r\n".to_vec(), b"456\r\n".to_vec()]);

    server.shutdown().unwrap();
}

#[test]
fn test_quit_line_closes_gracefully() {
    let (handler, events) = Recording::new(Mode::Lines);

    let server = Server::new(None);
    let addr = server.listen(0, handler).unwrap();
    server.initialize(2, 2, None).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(b"quit\r\n").unwrap();

    // The server finishes its side; the client observes a clean EOF.
    let mut sink = [0u8; 16];
    let n = client.read(&mut sink).unwrap();
    assert_eq!(n, 0);

    assert!(wait_until(WAIT, || events.disconnected() == 1));
    assert_eq!(events.message_count(), 1);

    server.shutdown().unwrap();
}

#[test]
fn test_receive_timeout_disconnects_idle_client() {
    let (handler, events) = Recording::new(Mode::Record);

    let server = Server::new(None);
    let mut configure = Configure::default();
    configure.incoming_receive_timeout = Duration::from_secs(1);
    server.configure(configure);

    let addr = server.listen(0, handler).unwrap();
    server.initialize(1, 1, None).unwrap();

    let client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    assert!(wait_until(WAIT, || events.connected() == 1));

    // Send nothing: the health check must cut the connection.
    assert!(wait_until(WAIT, || events.disconnected() == 1));
    assert_eq!(events.message_count(), 0);
    assert!(events
        .errors
        .lock()
        .iter()
        .any(|(_, kind)| *kind == std::io::ErrorKind::TimedOut));

    drop(client);
    server.shutdown().unwrap();
}

#[test]
fn test_framework_client_roundtrip() {
    let (server_handler, server_events) = Recording::new(Mode::Echo);

    let server = Server::new(None);
    let addr = server.listen(0, server_handler).unwrap();
    server.initialize(2, 2, None).unwrap();

    let (client_handler, client_events) = Recording::new(Mode::Record);
    let client = Server::new(None);
    client.initialize(1, 1, None).unwrap();

    let channel = client
        .connect_tcp4("127.0.0.1", addr.port(), client_handler, None)
        .unwrap();
    client.send(channel, b"loopback").unwrap();

    assert!(wait_until(WAIT, || client_events.received() == b"loopback"));
    assert_eq!(client_events.connected(), 1);
    assert_eq!(server_events.connected(), 1);

    client.disconnect(channel, true).unwrap();
    assert!(wait_until(WAIT, || server_events.disconnected() == 1));

    client.shutdown().unwrap();
    server.shutdown().unwrap();
}

#[test]
fn test_length_prefixed_frames_across_split_writes() {
    let (handler, events) = Recording::new(Mode::Prefixed);

    let server = Server::new(None);
    let addr = server.listen(0, handler).unwrap();
    server.initialize(1, 1, None).unwrap();

    let mut stream = prefixed(b"first message");
    stream.extend_from_slice(&prefixed(b"second"));

    // Deliver the two frames in awkward slices: header split from payload.
    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    client.write_all(&stream[..2]).unwrap();
    client.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(&stream[2..9]).unwrap();
    client.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(&stream[9..]).unwrap();

    assert!(wait_until(WAIT, || events.message_count() == 2));

    let messages = events.messages.lock().clone();
    assert_eq!(messages, vec![b"first message".to_vec(), b"second".to_vec()]);

    // The echo comes back with headers intact.
    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut reply = vec![0u8; stream.len()];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, stream);

    drop(client);
    server.shutdown().unwrap();
}

#[test]
fn test_multiple_messages_stay_ordered() {
    let (handler, events) = Recording::new(Mode::Lines);

    let server = Server::new(None);
    let addr = server.listen(0, handler).unwrap();
    server.initialize(1, 1, None).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    for index in 0..50u32 {
        client.write_all(format!("line-{}\r\n", index).as_bytes()).unwrap();
    }

    assert!(wait_until(WAIT, || events.message_count() == 50));

    let messages = events.messages.lock().clone();
    for (index, message) in messages.iter().enumerate() {
        assert_eq!(message, format!("line-{}\r\n", index).as_bytes());
    }

    drop(client);
    server.shutdown().unwrap();
}
