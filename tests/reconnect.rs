//! Outgoing channels: connect failures surface through `on_error`, the
//! channel survives them, and a later send re-establishes the connection
//! from the retained metadata.

mod common;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use common::{wait_until, Mode, Recording};
use trellis::Server;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_send_reconnects_once_server_appears() {
    let (handler, events) = Recording::new(Mode::Record);

    // Reserve a port, then free it again: connecting there must fail.
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let client = Server::new(None);
    client.initialize(1, 1, None).unwrap();

    let channel = client
        .connect_tcp4("127.0.0.1", port, handler, None)
        .unwrap();
    assert_ne!(channel, trellis::INVALID_CHANNEL);

    // The initial attempt is refused; the channel stays allocated.
    assert!(wait_until(WAIT, || events.error_count() >= 1));
    assert_eq!(events.connected(), 0);

    // A send without a listener retries and fails again, loudly.
    let errors_before = events.error_count();
    client.send(channel, b"ping").unwrap();
    assert!(wait_until(WAIT, || events.error_count() > errors_before));

    // Now the destination comes up: a blocking one-shot echo server.
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buffer = [0u8; 256];
            while let Ok(n) = stream.read(&mut buffer) {
                if n == 0 {
                    break;
                }
                if stream.write_all(&buffer[..n]).is_err() {
                    break;
                }
            }
        }
    });

    client.send(channel, b"hello").unwrap();

    assert!(wait_until(WAIT, || events.connected() == 1));
    assert!(wait_until(WAIT, || events.received() == b"hello"));

    // Forgetting twice is a no-op the second time.
    client.forget(channel);
    client.forget(channel);

    client.disconnect(channel, true).unwrap();
    assert!(wait_until(WAIT, || events.disconnected() >= 1));

    client.shutdown().unwrap();
}

#[test]
fn test_forgotten_channel_does_not_reconnect() {
    let (handler, events) = Recording::new(Mode::Record);

    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let client = Server::new(None);
    client.initialize(1, 0, None).unwrap();

    let channel = client
        .connect_tcp4("127.0.0.1", port, handler, None)
        .unwrap();
    assert!(wait_until(WAIT, || events.error_count() >= 1));

    client.forget(channel);

    // With the metadata gone a send cannot retry; no new error appears.
    let errors_before = events.error_count();
    client.send(channel, b"void").unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(events.error_count(), errors_before);

    client.shutdown().unwrap();
}

#[test]
fn test_resolver_failure_fails_the_connect_call() {
    let client = Server::new(None);
    client.initialize(1, 0, None).unwrap();

    let (handler, _events) = Recording::new(Mode::Record);
    let result = client.connect_tcp4("host.invalid", 9, handler, None);
    assert!(result.is_err());

    client.shutdown().unwrap();
}
