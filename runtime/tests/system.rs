//! End-to-end tests against real sockets on ephemeral ports.

use colossus_runtime::{
    Callback, Config, ConnectionHandler, Context, DataBuffer, Encoder, Error, Initializer,
    IoSystem, ServerState, WorkerItem, WriteHandle,
};
use std::{
    any::Any,
    io::{Read, Write},
    net::TcpStream,
    sync::mpsc,
    time::{Duration, Instant},
};

fn read_exact_with_deadline(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut out = vec![0u8; len];
    stream.read_exact(&mut out).unwrap();
    out
}

struct Echo;

impl ConnectionHandler for Echo {
    fn on_data(
        &mut self,
        _ctx: &Context,
        buf: &mut DataBuffer,
        write: &WriteHandle,
    ) -> Result<(), Error> {
        let bytes = buf.take_all();
        write.write(Encoder::block(DataBuffer::new(bytes)))?;
        Ok(())
    }
}

struct EchoInitializer;

impl Initializer for EchoInitializer {
    fn on_connect(&mut self, _ctx: &Context) -> Result<Box<dyn ConnectionHandler>, Error> {
        Ok(Box::new(Echo))
    }
}

fn echo_factory(_: &Context) -> Box<dyn Initializer> {
    Box::new(EchoInitializer)
}

#[test]
fn test_echo_round_trip() {
    let system = IoSystem::start(
        Config::default()
            .with_name("echo_round_trip")
            .with_num_workers(2),
    )
    .unwrap();
    let server = system
        .serve("echo", "127.0.0.1:0".parse().unwrap(), echo_factory)
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.write_all(b"hello").unwrap();
    assert_eq!(read_exact_with_deadline(&mut stream, 5), b"hello");

    // A second exchange over the same connection.
    stream.write_all(b"colossus").unwrap();
    assert_eq!(read_exact_with_deadline(&mut stream, 8), b"colossus");

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_many_connections_across_workers() {
    let system = IoSystem::start(
        Config::default()
            .with_name("echo_many")
            .with_num_workers(3),
    )
    .unwrap();
    let server = system
        .serve("echo", "127.0.0.1:0".parse().unwrap(), echo_factory)
        .unwrap();

    let mut streams: Vec<TcpStream> = (0..12)
        .map(|_| TcpStream::connect(server.local_addr()).unwrap())
        .collect();
    for (i, stream) in streams.iter_mut().enumerate() {
        let msg = format!("message-{i}");
        stream.write_all(msg.as_bytes()).unwrap();
        assert_eq!(
            read_exact_with_deadline(stream, msg.len()),
            msg.as_bytes()
        );
    }

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_zero_workers_fails_every_bind() {
    let system = IoSystem::start(
        Config::default()
            .with_name("null_system")
            .with_num_workers(0),
    )
    .unwrap();
    assert!(matches!(
        system.serve("echo", "127.0.0.1:0".parse().unwrap(), echo_factory),
        Err(Error::NoWorkers)
    ));
    assert!(matches!(
        system.bind(|_| Box::new(Nop) as Box<dyn WorkerItem>),
        Err(Error::NoWorkers)
    ));
    system.shutdown(Duration::from_millis(100));
}

struct Nop;

impl WorkerItem for Nop {}

struct Probe {
    events: mpsc::Sender<String>,
}

impl WorkerItem for Probe {
    fn on_bind(&mut self, _ctx: &Context) {
        let _ = self.events.send("bind".to_string());
    }

    fn on_message(&mut self, _ctx: &Context, message: Box<dyn Any + Send>) {
        if let Ok(text) = message.downcast::<String>() {
            let _ = self.events.send(format!("message:{text}"));
        }
    }

    fn on_unbind(&mut self, _ctx: &Context) {
        let _ = self.events.send("unbind".to_string());
    }
}

#[test]
fn test_bound_item_receives_events() {
    let system = IoSystem::start(
        Config::default()
            .with_name("item_events")
            .with_num_workers(1),
    )
    .unwrap();
    let (tx, rx) = mpsc::channel();

    let (worker, id) = system
        .bind(move |_ctx| Box::new(Probe { events: tx }) as Box<dyn WorkerItem>)
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "bind");

    worker
        .send(colossus_runtime::Command::Message {
            target: id,
            payload: Box::new("ping".to_string()),
        })
        .unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "message:ping"
    );

    system.shutdown(Duration::from_secs(2));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "unbind");
}

/// Echoes through an off-worker thread: the handler offloads the payload via
/// the async bridge and the response is written when the result is imported
/// back onto the owning worker.
struct BridgedEcho;

impl ConnectionHandler for BridgedEcho {
    fn on_data(
        &mut self,
        ctx: &Context,
        buf: &mut DataBuffer,
        write: &WriteHandle,
    ) -> Result<(), Error> {
        let input = buf.take_all();
        let (handle, completer) = ctx.bridge::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut output = input.to_vec();
            output.make_ascii_uppercase();
            completer.complete(Ok(output));
        });
        let write = write.clone();
        let owner = std::thread::current().id();
        Callback::from_async(handle).execute(move |result| {
            // The continuation must resume on the worker that created the
            // callback; a violation panics the test server and the client
            // read below times out.
            assert_eq!(std::thread::current().id(), owner);
            if let Ok(bytes) = result {
                let _ = write.write(Encoder::block(bytes));
            }
        });
        Ok(())
    }
}

struct BridgedInitializer;

impl Initializer for BridgedInitializer {
    fn on_connect(&mut self, _ctx: &Context) -> Result<Box<dyn ConnectionHandler>, Error> {
        Ok(Box::new(BridgedEcho))
    }
}

fn bridged_factory(_: &Context) -> Box<dyn Initializer> {
    Box::new(BridgedInitializer)
}

#[test]
fn test_async_bridge_round_trip() {
    let system = IoSystem::start(
        Config::default()
            .with_name("bridge")
            .with_num_workers(1),
    )
    .unwrap();
    let server = system
        .serve("upper", "127.0.0.1:0".parse().unwrap(), bridged_factory)
        .unwrap();

    // Two connections on the same single worker: a slow off-worker result
    // for one must not stall the other.
    let mut first = TcpStream::connect(server.local_addr()).unwrap();
    let mut second = TcpStream::connect(server.local_addr()).unwrap();

    first.write_all(b"abc").unwrap();
    assert_eq!(read_exact_with_deadline(&mut first, 3), b"ABC");

    second.write_all(b"xyz").unwrap();
    assert_eq!(read_exact_with_deadline(&mut second, 3), b"XYZ");

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_idle_timeout_closes_connection() {
    let system = IoSystem::start(
        Config::default()
            .with_name("idle")
            .with_num_workers(1)
            .with_connection_idle_timeout(Some(Duration::from_millis(200))),
    )
    .unwrap();
    let server = system
        .serve("echo", "127.0.0.1:0".parse().unwrap(), echo_factory)
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // No traffic: the sweep closes the connection and the read observes
    // either EOF or a reset.
    let start = Instant::now();
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from an idle connection"),
        Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset),
    }
    assert!(start.elapsed() >= Duration::from_millis(150));

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_server_drain_and_stop_states() {
    let system = IoSystem::start(
        Config::default()
            .with_name("states")
            .with_num_workers(1),
    )
    .unwrap();
    let server = system
        .serve("echo", "127.0.0.1:0".parse().unwrap(), echo_factory)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.state() != ServerState::Running && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.state(), ServerState::Running);

    // An established connection keeps working across a drain.
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.write_all(b"pre").unwrap();
    assert_eq!(read_exact_with_deadline(&mut stream, 3), b"pre");

    server.drain();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.state() != ServerState::Draining && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.state(), ServerState::Draining);

    stream.write_all(b"mid").unwrap();
    assert_eq!(read_exact_with_deadline(&mut stream, 3), b"mid");

    server.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.state() != ServerState::Stopped && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.state(), ServerState::Stopped);

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_metrics_exported_under_system_prefix() {
    let system = IoSystem::start(
        Config::default()
            .with_name("metered")
            .with_num_workers(1),
    )
    .unwrap();
    let server = system
        .serve("echo", "127.0.0.1:0".parse().unwrap(), echo_factory)
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.write_all(b"ping").unwrap();
    assert_eq!(read_exact_with_deadline(&mut stream, 4), b"ping");

    let exported = system.encode_metrics();
    assert!(exported.contains("metered_connections_accepted"));
    assert!(exported.contains("metered_bytes_read"));

    system.shutdown(Duration::from_secs(2));
}
