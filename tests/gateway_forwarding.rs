//! End-to-end tests for the gateway: publishers on one side, a scripted
//! stand-in for the broker on the other.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use pretty_assertions::assert_eq;
use tinybus::gateway::{Gateway, GatewayConfig};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

struct TestGateway {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestGateway {
    fn start(broker_addr: SocketAddr) -> anyhow::Result<TestGateway> {
        let config = GatewayConfig {
            broker_addr,
            ..GatewayConfig::default()
        };
        let mut gateway = Gateway::bind("127.0.0.1:0".parse()?, config)?;
        let addr = gateway.local_addr()?;
        let stop = gateway.stop_flag();
        let handle = thread::spawn(move || gateway.run());

        Ok(TestGateway {
            addr,
            stop,
            handle: Some(handle),
        })
    }

    fn connect(&self) -> anyhow::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr).context("connecting to test gateway")?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Drop for TestGateway {
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

fn publish(stream: &mut TcpStream, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    write!(stream, "PUB {} {}\n", topic, payload.len())?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

fn expect_eof(stream: &mut TcpStream) -> anyhow::Result<()> {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "expected the gateway to close the connection"),
        // A close racing with in-flight bytes surfaces as a reset.
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

/// An ephemeral port with nothing listening on it.
fn dead_addr() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

fn accept_with_timeout(listener: &TcpListener) -> anyhow::Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + ACCEPT_TIMEOUT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(READ_TIMEOUT))?;
                return Ok(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    bail!("timed out waiting for the gateway to connect");
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[test_log::test]
fn forwards_framed_publishes_to_the_broker() -> anyhow::Result<()> {
    let broker = TcpListener::bind("127.0.0.1:0")?;
    let gateway = TestGateway::start(broker.local_addr()?)?;

    let mut publisher = gateway.connect()?;
    publisher.write_all(b"HELLO PUBLISHER px\n")?;
    assert_eq!(read_line(&mut publisher)?, "OK");

    publish(&mut publisher, "t", b"ping")?;
    assert_eq!(read_line(&mut publisher)?, "OK");

    let mut link = accept_with_timeout(&broker)?;
    let expected = b"PUB t 4\n\x00\x00\x00\x04ping";
    let mut received = vec![0u8; expected.len()];
    link.read_exact(&mut received)?;
    assert_eq!(received, expected.to_vec());

    Ok(())
}

#[test_log::test]
fn forwards_in_publish_order() -> anyhow::Result<()> {
    let broker = TcpListener::bind("127.0.0.1:0")?;
    let gateway = TestGateway::start(broker.local_addr()?)?;

    let mut publisher = gateway.connect()?;
    publish(&mut publisher, "seq", b"one")?;
    assert_eq!(read_line(&mut publisher)?, "OK");
    publish(&mut publisher, "seq", b"two")?;
    assert_eq!(read_line(&mut publisher)?, "OK");

    let mut link = accept_with_timeout(&broker)?;
    let expected = b"PUB seq 3\n\x00\x00\x00\x03onePUB seq 3\n\x00\x00\x00\x03two";
    let mut received = vec![0u8; expected.len()];
    link.read_exact(&mut received)?;
    assert_eq!(received, expected.to_vec());

    Ok(())
}

#[test_log::test]
fn acknowledges_publishes_while_broker_is_down() -> anyhow::Result<()> {
    let gateway = TestGateway::start(dead_addr()?)?;

    let mut publisher = gateway.connect()?;
    publisher.write_all(b"HELLO PUBLISHER px\n")?;
    assert_eq!(read_line(&mut publisher)?, "OK");

    // The queue buffers the messages; the publisher is not stalled by the
    // unreachable broker.
    for i in 0..10 {
        publish(&mut publisher, "buffered", format!("m{i}").as_bytes())?;
        assert_eq!(read_line(&mut publisher)?, "OK");
    }

    Ok(())
}

#[test_log::test]
fn rejects_subscription_commands() -> anyhow::Result<()> {
    let gateway = TestGateway::start(dead_addr()?)?;

    let mut client = gateway.connect()?;
    client.write_all(b"SUB topic\n")?;
    assert_eq!(read_line(&mut client)?, "ERR PROTO");
    expect_eof(&mut client)?;

    Ok(())
}

#[test_log::test]
fn ping_and_bye() -> anyhow::Result<()> {
    let gateway = TestGateway::start(dead_addr()?)?;

    let mut client = gateway.connect()?;
    client.write_all(b"PING\n")?;
    assert_eq!(read_line(&mut client)?, "PONG");
    client.write_all(b"BYE\n")?;
    assert_eq!(read_line(&mut client)?, "OK");
    expect_eof(&mut client)?;

    Ok(())
}

#[test_log::test]
fn length_prefix_mismatch_is_fatal() -> anyhow::Result<()> {
    let gateway = TestGateway::start(dead_addr()?)?;

    let mut publisher = gateway.connect()?;
    publisher.write_all(b"PUB t 4\n")?;
    publisher.write_all(&5u32.to_be_bytes())?;
    publisher.write_all(b"pings")?;
    assert_eq!(read_line(&mut publisher)?, "ERR LEN");
    expect_eof(&mut publisher)?;

    Ok(())
}

#[test_log::test]
fn oversized_publish_is_rejected() -> anyhow::Result<()> {
    let gateway = TestGateway::start(dead_addr()?)?;

    let mut publisher = gateway.connect()?;
    publisher.write_all(b"PUB t 8193\n")?;
    assert_eq!(read_line(&mut publisher)?, "ERR OVERFLOW");
    expect_eof(&mut publisher)?;

    Ok(())
}
