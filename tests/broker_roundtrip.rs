//! End-to-end tests for the broker: real sockets, real wire protocol.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use pretty_assertions::assert_eq;
use tinybus::broker::Broker;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct TestBroker {
    addr: std::net::SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestBroker {
    fn start() -> anyhow::Result<TestBroker> {
        let mut broker = Broker::bind("127.0.0.1:0".parse()?)?;
        let addr = broker.local_addr()?;
        let stop = broker.stop_flag();
        let handle = thread::spawn(move || broker.run());

        Ok(TestBroker {
            addr,
            stop,
            handle: Some(handle),
        })
    }

    fn connect(&self) -> anyhow::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr).context("connecting to test broker")?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_line(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8(line)?)
}

fn read_delivery(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn publish(stream: &mut TcpStream, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    write!(stream, "PUB {} {}\n", topic, payload.len())?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

fn expect_eof(stream: &mut TcpStream) -> anyhow::Result<()> {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "expected the broker to close the connection"),
        // A close racing with in-flight bytes surfaces as a reset.
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[test_log::test]
fn single_subscriber_round_trip() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut subscriber = broker.connect()?;
    subscriber.write_all(b"HELLO SUBSCRIBER s1\n")?;
    assert_eq!(read_line(&mut subscriber)?, "OK");
    subscriber.write_all(b"SUB temp\n")?;
    assert_eq!(read_line(&mut subscriber)?, "OK");

    let mut publisher = broker.connect()?;
    publisher.write_all(b"HELLO PUBLISHER p1\n")?;
    assert_eq!(read_line(&mut publisher)?, "OK");

    publish(&mut publisher, "temp", b"hello")?;
    assert_eq!(read_delivery(&mut subscriber)?, b"hello".to_vec());

    // The next delivery is the next publish: the first arrived exactly once.
    publish(&mut publisher, "temp", b"again")?;
    assert_eq!(read_delivery(&mut subscriber)?, b"again".to_vec());

    Ok(())
}

#[test_log::test]
fn ping_pong() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut client = broker.connect()?;
    client.write_all(b"PING\n")?;
    assert_eq!(read_line(&mut client)?, "PONG");

    Ok(())
}

#[test_log::test]
fn bye_closes_after_reply() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut client = broker.connect()?;
    client.write_all(b"BYE\n")?;
    assert_eq!(read_line(&mut client)?, "OK");
    expect_eof(&mut client)?;

    Ok(())
}

#[test_log::test]
fn pipelined_commands_in_one_write() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut client = broker.connect()?;
    client.write_all(b"HELLO SUBSCRIBER s2\nSUB x\nPING\n")?;
    assert_eq!(read_line(&mut client)?, "OK");
    assert_eq!(read_line(&mut client)?, "OK");
    assert_eq!(read_line(&mut client)?, "PONG");

    Ok(())
}

#[test_log::test]
fn unknown_role_is_tolerated() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut client = broker.connect()?;
    client.write_all(b"HELLO WIZARD w1\n")?;
    assert_eq!(read_line(&mut client)?, "OK");

    Ok(())
}

#[test_log::test]
fn publish_without_subscribers_is_not_an_error() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut publisher = broker.connect()?;
    publisher.write_all(b"HELLO PUBLISHER p1\n")?;
    assert_eq!(read_line(&mut publisher)?, "OK");

    publish(&mut publisher, "ghost", b"anyone?")?;

    // No reply to the publish, no error: the connection stays usable.
    publisher.write_all(b"PING\n")?;
    assert_eq!(read_line(&mut publisher)?, "PONG");

    Ok(())
}

#[test_log::test]
fn unsubscribe_stops_delivery() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut subscriber = broker.connect()?;
    subscriber.write_all(b"HELLO SUBSCRIBER s1\nSUB a\nSUB b\n")?;
    for _ in 0..3 {
        assert_eq!(read_line(&mut subscriber)?, "OK");
    }
    subscriber.write_all(b"UNSUB a\n")?;
    assert_eq!(read_line(&mut subscriber)?, "OK");

    let mut publisher = broker.connect()?;
    publish(&mut publisher, "a", b"dropped")?;
    publish(&mut publisher, "b", b"kept")?;

    // Deliveries are FIFO per connection: if the publish to "a" had been
    // delivered, it would arrive first.
    assert_eq!(read_delivery(&mut subscriber)?, b"kept".to_vec());

    Ok(())
}

#[test_log::test]
fn publish_length_zero_is_rejected() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut publisher = broker.connect()?;
    publisher.write_all(b"PUB t 0\n")?;
    assert_eq!(read_line(&mut publisher)?, "ERR OVERFLOW");
    expect_eof(&mut publisher)?;

    Ok(())
}

#[test_log::test]
fn publish_length_over_limit_is_rejected() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut publisher = broker.connect()?;
    publisher.write_all(b"PUB t 8193\n")?;
    assert_eq!(read_line(&mut publisher)?, "ERR OVERFLOW");
    expect_eof(&mut publisher)?;

    Ok(())
}

#[test_log::test]
fn unknown_command_is_fatal() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut client = broker.connect()?;
    client.write_all(b"BOGUS\n")?;
    assert_eq!(read_line(&mut client)?, "ERR PROTO");
    expect_eof(&mut client)?;

    Ok(())
}

#[test_log::test]
fn length_prefix_mismatch_aborts_without_delivery() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut subscriber = broker.connect()?;
    subscriber.write_all(b"HELLO SUBSCRIBER s1\nSUB t\n")?;
    assert_eq!(read_line(&mut subscriber)?, "OK");
    assert_eq!(read_line(&mut subscriber)?, "OK");

    let mut publisher = broker.connect()?;
    publisher.write_all(b"PUB t 5\n")?;
    publisher.write_all(&6u32.to_be_bytes())?;
    publisher.write_all(b"hello!")?;
    assert_eq!(read_line(&mut publisher)?, "ERR LEN");
    expect_eof(&mut publisher)?;

    // Nothing was delivered; the next successful publish arrives first.
    let mut publisher = broker.connect()?;
    publish(&mut publisher, "t", b"clean")?;
    assert_eq!(read_delivery(&mut subscriber)?, b"clean".to_vec());

    Ok(())
}

#[test_log::test]
fn dead_subscriber_does_not_break_fanout() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut doomed = broker.connect()?;
    doomed.write_all(b"HELLO SUBSCRIBER dead\nSUB t\n")?;
    assert_eq!(read_line(&mut doomed)?, "OK");
    assert_eq!(read_line(&mut doomed)?, "OK");

    let mut survivor = broker.connect()?;
    survivor.write_all(b"HELLO SUBSCRIBER live\nSUB t\n")?;
    assert_eq!(read_line(&mut survivor)?, "OK");
    assert_eq!(read_line(&mut survivor)?, "OK");

    // Close one subscriber abruptly and give the loop a moment to reap it.
    drop(doomed);
    thread::sleep(Duration::from_millis(300));

    let mut publisher = broker.connect()?;
    publish(&mut publisher, "t", b"still here")?;
    assert_eq!(read_delivery(&mut survivor)?, b"still here".to_vec());

    publish(&mut publisher, "t", b"and again")?;
    assert_eq!(read_delivery(&mut survivor)?, b"and again".to_vec());

    Ok(())
}

#[test_log::test]
fn max_payload_round_trips() -> anyhow::Result<()> {
    let broker = TestBroker::start()?;

    let mut subscriber = broker.connect()?;
    subscriber.write_all(b"HELLO SUBSCRIBER s1\nSUB big\n")?;
    assert_eq!(read_line(&mut subscriber)?, "OK");
    assert_eq!(read_line(&mut subscriber)?, "OK");

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let mut publisher = broker.connect()?;
    publish(&mut publisher, "big", &payload)?;

    assert_eq!(read_delivery(&mut subscriber)?, payload);

    Ok(())
}
