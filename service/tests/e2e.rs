//! End-to-end service and client scenarios over real sockets.
//!
//! The wire protocol is a newline-delimited line codec: enough to exercise
//! pipelining, reordering, oversized frames, deadlines, and reconnects
//! without dragging in a production protocol.

use colossus_runtime::{
    Callback, Config, Context, DataBuffer, Encoder, Error, IoSystem, Resolver, WorkerItem,
};
use colossus_service::{factory, Client, ClientConfig, Codec, Decoded, RetryPolicy};
use std::{
    any::Any,
    cell::RefCell,
    io::{Read, Write},
    net::TcpStream,
    rc::Rc,
    sync::mpsc,
    time::{Duration, Instant},
};

struct LineCodec;

impl Codec for LineCodec {
    type Input = String;
    type Output = String;

    fn decode(&mut self, buf: &mut DataBuffer) -> Result<Decoded<String>, Error> {
        let Some(position) = buf.as_slice().iter().position(|byte| *byte == b'\n') else {
            return Ok(Decoded::More);
        };
        let line = buf.take(position);
        buf.advance(1);
        let line = String::from_utf8(line.to_vec())
            .map_err(|_| Error::Protocol("line is not utf-8".into()))?;
        Ok(Decoded::Frame(line))
    }

    fn encode(&mut self, output: String) -> Encoder {
        Encoder::sized(output.len() + 1, move |out| {
            out.write(output.as_bytes())?;
            out.write(b"\n")
        })
    }

    fn error_response(&mut self, _input: Option<&String>, cause: &Error) -> Option<String> {
        Some(format!("error: {cause}"))
    }
}

fn read_line(stream: &mut TcpStream) -> String {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).unwrap();
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
        line.push(byte[0]);
    }
}

#[test]
fn test_line_service_round_trip() {
    let system = IoSystem::start(
        Config::default()
            .with_name("svc_round_trip")
            .with_num_workers(2),
    )
    .unwrap();
    let server = system
        .serve(
            "lines",
            "127.0.0.1:0".parse().unwrap(),
            factory(
                || LineCodec,
                |_ctx: &Context| {
                    |_ctx: &Context, request: String| {
                        Callback::successful(format!("echo {request}"))
                    }
                },
            ),
        )
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.write_all(b"one\n").unwrap();
    assert_eq!(read_line(&mut stream), "echo one");

    stream.write_all(b"two\nthree\n").unwrap();
    assert_eq!(read_line(&mut stream), "echo two");
    assert_eq!(read_line(&mut stream), "echo three");

    system.shutdown(Duration::from_secs(2));
}

/// Handler for the pipelining test: "hold" requests park their callbacks,
/// "burst" resolves the parked callbacks in reverse order before its own
/// response completes.
struct HoldHandler {
    held: Rc<RefCell<Vec<(usize, Resolver<String>)>>>,
    counter: usize,
}

impl colossus_service::RequestHandler<LineCodec> for HoldHandler {
    fn receive(&mut self, _ctx: &Context, request: String) -> Callback<String> {
        match request.as_str() {
            "hold" => {
                let (callback, resolver) = Callback::promise();
                self.held.borrow_mut().push((self.counter, resolver));
                self.counter += 1;
                callback
            }
            "burst" => {
                let mut held = self.held.borrow_mut();
                // Reverse completion order: the wire order must not change.
                while let Some((index, resolver)) = held.pop() {
                    resolver.resolve(Ok(format!("held-{index}")));
                }
                Callback::successful("burst-done".to_string())
            }
            other => Callback::successful(format!("echo {other}")),
        }
    }
}

#[test]
fn test_pipelined_responses_keep_arrival_order() {
    let system = IoSystem::start(
        Config::default()
            .with_name("svc_pipeline")
            .with_num_workers(1),
    )
    .unwrap();
    let server = system
        .serve(
            "holds",
            "127.0.0.1:0".parse().unwrap(),
            factory(
                || LineCodec,
                |_ctx: &Context| HoldHandler {
                    held: Rc::new(RefCell::new(Vec::new())),
                    counter: 0,
                },
            ),
        )
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    // Three pipelined requests; completions happen in the order
    // held-1, held-0, burst-done, but the wire stays 0, 1, 2.
    stream.write_all(b"hold\nhold\nburst\n").unwrap();
    assert_eq!(read_line(&mut stream), "held-0");
    assert_eq!(read_line(&mut stream), "held-1");
    assert_eq!(read_line(&mut stream), "burst-done");

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_handler_failure_maps_to_error_response() {
    let system = IoSystem::start(
        Config::default()
            .with_name("svc_errors")
            .with_num_workers(1),
    )
    .unwrap();
    let server = system
        .serve(
            "errors",
            "127.0.0.1:0".parse().unwrap(),
            factory(
                || LineCodec,
                |_ctx: &Context| {
                    |_ctx: &Context, request: String| {
                        if request == "boom" {
                            Callback::failed(Error::handler(std::io::Error::other("kaput")))
                        } else {
                            Callback::successful(format!("echo {request}"))
                        }
                    }
                },
            ),
        )
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.write_all(b"boom\nstill-alive\n").unwrap();
    assert_eq!(read_line(&mut stream), "error: handler: kaput");
    assert_eq!(read_line(&mut stream), "echo still-alive");

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_oversized_frame_spills_and_delivers() {
    // An 8 KiB write scratch against a 64 KiB response: the sized producer
    // runs once against the overflow buffer and the bytes drain in scratch
    // batches.
    let system = IoSystem::start(
        Config::default()
            .with_name("svc_overflow")
            .with_num_workers(1)
            .with_write_buffer_kb(8),
    )
    .unwrap();
    let payload: String = "abcdefghij".chars().cycle().take(64 * 1024).collect();
    let response = payload.clone();
    let server = system
        .serve(
            "big",
            "127.0.0.1:0".parse().unwrap(),
            factory(
                || LineCodec,
                move |_ctx: &Context| {
                    let response = response.clone();
                    move |_ctx: &Context, _request: String| {
                        Callback::successful(response.clone())
                    }
                },
            ),
        )
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.write_all(b"gimme\n").unwrap();
    assert_eq!(read_line(&mut stream), payload);

    system.shutdown(Duration::from_secs(2));
}

/// Worker item that owns a [`Client`] and drives it from test commands.
struct Driver {
    addr: std::net::SocketAddr,
    cfg: ClientConfig,
    results: mpsc::Sender<Result<String, Error>>,
    client: Option<Client<LineCodec>>,
}

impl WorkerItem for Driver {
    fn on_bind(&mut self, ctx: &Context) {
        self.client = Some(Client::open(ctx, self.addr, LineCodec, self.cfg.clone()));
    }

    fn on_message(&mut self, _ctx: &Context, message: Box<dyn Any + Send>) {
        let Ok(request) = message.downcast::<String>() else {
            return;
        };
        let client = self.client.as_ref().expect("client opened on bind");
        let results = self.results.clone();
        client.send(*request).execute(move |result| {
            let _ = results.send(result);
        });
    }
}

#[test]
fn test_client_round_trip_with_queued_send() {
    let system = IoSystem::start(
        Config::default()
            .with_name("client_rt")
            .with_num_workers(2),
    )
    .unwrap();
    let server = system
        .serve(
            "lines",
            "127.0.0.1:0".parse().unwrap(),
            factory(
                || LineCodec,
                |_ctx: &Context| {
                    |_ctx: &Context, request: String| {
                        Callback::successful(format!("echo {request}"))
                    }
                },
            ),
        )
        .unwrap();

    let (results_tx, results_rx) = mpsc::channel();
    let addr = server.local_addr();
    let (worker, driver) = system
        .bind(move |_ctx| {
            Box::new(Driver {
                addr,
                cfg: ClientConfig::default().with_request_timeout(Duration::from_secs(5)),
                results: results_tx,
                client: None,
            }) as Box<dyn WorkerItem>
        })
        .unwrap();

    // Sent while the client may still be connecting: queued and flushed.
    worker
        .send(colossus_runtime::Command::Message {
            target: driver,
            payload: Box::new("early".to_string()),
        })
        .unwrap();
    assert_eq!(
        results_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ok("echo early".to_string())
    );

    worker
        .send(colossus_runtime::Command::Message {
            target: driver,
            payload: Box::new("later".to_string()),
        })
        .unwrap();
    assert_eq!(
        results_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ok("echo later".to_string())
    );

    system.shutdown(Duration::from_secs(2));
}

/// Parks every request forever; resolvers are kept so responses never come.
struct BlackHole {
    parked: Rc<RefCell<Vec<Resolver<String>>>>,
}

impl colossus_service::RequestHandler<LineCodec> for BlackHole {
    fn receive(&mut self, _ctx: &Context, _request: String) -> Callback<String> {
        let (callback, resolver) = Callback::promise();
        self.parked.borrow_mut().push(resolver);
        callback
    }
}

#[test]
fn test_client_timeout_poisons_connection() {
    let system = IoSystem::start(
        Config::default()
            .with_name("client_timeout")
            .with_num_workers(2),
    )
    .unwrap();
    let server = system
        .serve(
            "silent",
            "127.0.0.1:0".parse().unwrap(),
            factory(
                || LineCodec,
                |_ctx: &Context| BlackHole {
                    parked: Rc::new(RefCell::new(Vec::new())),
                },
            ),
        )
        .unwrap();

    let (results_tx, results_rx) = mpsc::channel();
    let addr = server.local_addr();
    let (worker, driver) = system
        .bind(move |_ctx| {
            Box::new(Driver {
                addr,
                cfg: ClientConfig::default().with_request_timeout(Duration::from_millis(100)),
                results: results_tx,
                client: None,
            }) as Box<dyn WorkerItem>
        })
        .unwrap();

    let started = Instant::now();
    for request in ["first", "second"] {
        worker
            .send(colossus_runtime::Command::Message {
                target: driver,
                payload: Box::new(request.to_string()),
            })
            .unwrap();
    }

    // The first entry times out; the poisoned close fails the second with a
    // disconnection error.
    let first = results_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, Err(Error::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80), "fired at {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "fired at {elapsed:?}");

    let second = results_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second, Err(Error::Disconnected));

    system.shutdown(Duration::from_secs(2));
}

#[test]
fn test_client_reconnects_after_server_restart() {
    let server_system = IoSystem::start(
        Config::default()
            .with_name("restart_a")
            .with_num_workers(1),
    )
    .unwrap();
    let echo = factory(
        || LineCodec,
        |_ctx: &Context| {
            |_ctx: &Context, request: String| Callback::successful(format!("echo {request}"))
        },
    );
    let server = server_system
        .serve("lines", "127.0.0.1:0".parse().unwrap(), echo)
        .unwrap();
    let addr = server.local_addr();

    let client_system = IoSystem::start(
        Config::default()
            .with_name("restart_client")
            .with_num_workers(1),
    )
    .unwrap();
    let (results_tx, results_rx) = mpsc::channel();
    let (worker, driver) = client_system
        .bind(move |_ctx| {
            Box::new(Driver {
                addr,
                cfg: ClientConfig::default()
                    .with_request_timeout(Duration::from_secs(5))
                    .with_retry(RetryPolicy::Fixed(Duration::from_millis(100))),
                results: results_tx,
                client: None,
            }) as Box<dyn WorkerItem>
        })
        .unwrap();

    worker
        .send(colossus_runtime::Command::Message {
            target: driver,
            payload: Box::new("before".to_string()),
        })
        .unwrap();
    assert_eq!(
        results_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ok("echo before".to_string())
    );

    // Tear the server down; the client loses its transport and retries.
    server_system.shutdown(Duration::from_secs(2));

    // Restart on the same address and drive another request through; it may
    // queue across several reconnect attempts.
    let server_system = IoSystem::start(
        Config::default()
            .with_name("restart_b")
            .with_num_workers(1),
    )
    .unwrap();
    let echo = factory(
        || LineCodec,
        |_ctx: &Context| {
            |_ctx: &Context, request: String| Callback::successful(format!("echo {request}"))
        },
    );
    server_system.serve("lines", addr, echo).unwrap();

    // The client may still hold the stale transport when the first send goes
    // out; retry until a response makes it through the new server.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut answered = None;
    while Instant::now() < deadline {
        worker
            .send(colossus_runtime::Command::Message {
                target: driver,
                payload: Box::new("after".to_string()),
            })
            .unwrap();
        match results_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(response)) => {
                answered = Some(response);
                break;
            }
            Ok(Err(_)) | Err(_) => continue,
        }
    }
    assert_eq!(answered.as_deref(), Some("echo after"));

    client_system.shutdown(Duration::from_secs(2));
    server_system.shutdown(Duration::from_secs(2));
}
