//! Client behavior against scripted locator and server fakes.

use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gkv_client::{
    ChannelListener, ClientConfig, ClientError, CqOperation, CqState, Endpoint, GridClient,
    RetryPolicy,
};
use gkv_common::{encode_pair, encode_value, read_response, RespValue, WireValue};

enum Step {
    Continue,
    Hangup,
}

fn read_command(reader: &mut BufReader<TcpStream>) -> Option<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    match read_response(reader, &mut line).ok()? {
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                RespValue::Bulk(Some(data)) => Some(data),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn write(stream: &mut TcpStream, value: &RespValue) {
    let mut out = Vec::new();
    encode_value(value, &mut out);
    let _ = stream.write_all(&out);
    let _ = stream.flush();
}

fn simple(msg: &str) -> RespValue {
    RespValue::Simple(msg.as_bytes().to_vec())
}

/// Locator answering `LOCATE` with `server`; stops listening after
/// `limit` connections when set.
fn spawn_locator(server: SocketAddr, limit: Option<usize>) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind locator");
    let addr = listener.local_addr().expect("locator addr");
    let answered = Arc::new(AtomicUsize::new(0));
    let counter = answered.clone();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            while read_command(&mut reader).is_some() {
                write(&mut stream, &RespValue::bulk(server.to_string()));
            }
            let served = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if limit.is_some_and(|limit| served >= limit) {
                break;
            }
        }
    });

    (addr, answered)
}

/// Server running `handler` for every command; the first argument is the
/// index of the connection, in accept order.
fn spawn_server<F>(handler: F) -> SocketAddr
where
    F: Fn(usize, &[Vec<u8>], &mut TcpStream) -> Step + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let handler = Arc::new(handler);

    thread::spawn(move || {
        for (index, stream) in listener.incoming().enumerate() {
            let Ok(mut stream) = stream else { break };
            let handler = handler.clone();
            thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                while let Some(args) = read_command(&mut reader) {
                    if let Step::Hangup = handler(index, &args, &mut stream) {
                        let _ = stream.shutdown(Shutdown::Both);
                        return;
                    }
                }
            });
        }
    });

    addr
}

fn config(locator: SocketAddr) -> ClientConfig {
    ClientConfig {
        read_timeout: Duration::from_secs(2),
        close_grace: Duration::from_millis(200),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        ..ClientConfig::with_locator(Endpoint::new("127.0.0.1", locator.port()))
    }
}

fn basic_reply(args: &[Vec<u8>], stream: &mut TcpStream) -> Step {
    match args[0].as_slice() {
        b"PING" => write(stream, &simple("PONG")),
        b"REGION" => write(stream, &simple("OK")),
        _ => write(stream, &RespValue::error("ERR", "unexpected command")),
    }
    Step::Continue
}

#[test]
fn transient_disconnect_is_retried_on_a_fresh_connection() {
    let server = spawn_server(|conn, args, stream| match (conn, args[0].as_slice()) {
        (0, b"GET") => Step::Hangup,
        (_, b"GET") => {
            assert_eq!(args[1], b"r");
            write(stream, &encode_pair(&WireValue::string("X")));
            Step::Continue
        }
        _ => basic_reply(args, stream),
    });
    let (locator, answered) = spawn_locator(server, None);

    let client = GridClient::connect(config(locator)).expect("connect");
    let region = client.region::<i32, String>("r").expect("region");
    assert_eq!(region.get(&1).expect("get"), Some("X".to_string()));
    assert!(answered.load(Ordering::SeqCst) >= 2, "retry re-asked the locator");
    client.close();
}

#[test]
fn persistent_disconnect_exhausts_retries() {
    let commands = AtomicUsize::new(0);
    let server = spawn_server(move |_, args, stream| {
        // Only the PING issued by connect is answered.
        if commands.fetch_add(1, Ordering::SeqCst) == 0 {
            return basic_reply(args, stream);
        }
        Step::Hangup
    });
    let (locator, _) = spawn_locator(server, None);
    let client = GridClient::connect(config(locator)).expect("connect");

    let started = Instant::now();
    match client.ping() {
        Err(ClientError::Retryable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected Retryable, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn lost_grid_makes_region_unavailable() {
    let server = spawn_server(|conn, args, stream| match (conn, args[0].as_slice()) {
        (0, b"PING") | (0, b"REGION") => basic_reply(args, stream),
        _ => Step::Hangup,
    });
    // Only the initial resolution succeeds; re-resolution finds no locator.
    let (locator, _) = spawn_locator(server, Some(1));

    let client = GridClient::connect(config(locator)).expect("connect");
    let region = client.region::<i32, String>("r").expect("region");

    match region.get(&1) {
        Err(ClientError::RegionUnavailable { region, .. }) => assert_eq!(region, "r"),
        other => panic!("expected RegionUnavailable, got {:?}", other),
    }
}

#[test]
fn unreachable_locator_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    match GridClient::connect(config(addr)) {
        Err(ClientError::Connection(message)) => assert!(message.contains("locator")),
        other => panic!("expected Connection, got {:?}", other.map(|_| ())),
    }
}

/// Fake node that acknowledges `SUBSCRIBE` and lets the test push frames.
struct PushingServer {
    addr: SocketAddr,
    subscribes: Arc<AtomicUsize>,
    registered: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
}

fn spawn_pushing_server<F>(on_register: F) -> PushingServer
where
    F: Fn(&str, &mut TcpStream) + Send + Sync + 'static,
{
    let subscriber: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
    let registered = Arc::new(Mutex::new(Vec::new()));
    let seen = registered.clone();
    let subscribes = Arc::new(AtomicUsize::new(0));
    let subscribed = subscribes.clone();

    let addr = spawn_server(move |_, args, stream| {
        match args[0].as_slice() {
            b"SUBSCRIBE" => {
                subscribed.fetch_add(1, Ordering::SeqCst);
                *subscriber.lock().unwrap() = Some(stream.try_clone().expect("clone"));
                write(stream, &simple("OK"));
            }
            b"CQ_REGISTER" => {
                seen.lock().unwrap().push(args.to_vec());
                write(stream, &simple("OK"));
                let name = String::from_utf8_lossy(&args[2]).into_owned();
                if let Some(push) = subscriber.lock().unwrap().as_mut() {
                    on_register(&name, push);
                }
            }
            b"CQ_CLOSE" => write(stream, &RespValue::Integer(1)),
            _ => return basic_reply(args, stream),
        }
        Step::Continue
    });

    PushingServer {
        addr,
        subscribes,
        registered,
    }
}

fn push_error(stream: &mut TcpStream, cq_name: &str, message: &str) {
    write(
        stream,
        &RespValue::Array(vec![
            RespValue::bulk("CQ_ERROR"),
            RespValue::bulk(cq_name),
            RespValue::bulk(message),
        ]),
    );
}

#[test]
fn pushed_cq_error_fires_on_error_once() {
    let server = spawn_pushing_server(|name, push| {
        push_error(push, name, "boom");
        push_error(push, name, "boom again");
    });
    let (locator, _) = spawn_locator(server.addr, None);
    let client = GridClient::connect(ClientConfig {
        subscription_enabled: true,
        ..config(locator)
    })
    .expect("connect");

    let region = client.region::<i32, String>("r").expect("region");
    let (listener, events) = ChannelListener::new();
    let cq = region
        .new_named_cq("failing", "this = 'X'", listener)
        .expect("create");
    cq.execute().expect("execute");

    let event = events.recv_timeout(Duration::from_secs(2)).expect("error event");
    assert_eq!(event.operation(), CqOperation::Error);
    assert_eq!(event.error_message(), Some("boom"));
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(cq.state(), CqState::Closed);
    assert!(client.running_cqs().is_empty());

    let registered = server.registered.lock().unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0][2], b"failing");
    assert_eq!(registered[0][3], b"SELECT * FROM /r this WHERE this = 'X'");
    drop(registered);
    client.close();
}

#[test]
fn lost_subscription_is_reopened_for_the_next_cq() {
    let dropped = AtomicBool::new(false);
    let server = spawn_pushing_server(move |_, push| {
        if !dropped.swap(true, Ordering::SeqCst) {
            let _ = push.shutdown(Shutdown::Both);
        }
    });
    let (locator, _) = spawn_locator(server.addr, None);
    let client = GridClient::connect(ClientConfig {
        subscription_enabled: true,
        ..config(locator)
    })
    .expect("connect");

    let region = client.region::<i32, String>("r").expect("region");
    let (listener, events) = ChannelListener::new();
    let cq = region.new_cq("SELECT * FROM /r", listener).expect("create");
    cq.execute().expect("execute");

    let event = events.recv_timeout(Duration::from_secs(2)).expect("error event");
    assert_eq!(event.operation(), CqOperation::Error);
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(cq.state(), CqState::Closed);
    assert_eq!(server.subscribes.load(Ordering::SeqCst), 1);

    let (listener, _events) = ChannelListener::<i32, String>::new();
    let next = region.new_cq("SELECT * FROM /r", listener).expect("create");
    next.execute().expect("execute on a fresh subscription");
    assert_eq!(next.state(), CqState::Running);
    assert_eq!(server.subscribes.load(Ordering::SeqCst), 2);
    assert_eq!(server.registered.lock().unwrap().len(), 2);
    client.close();
}

#[test]
fn registration_whose_reply_was_lost_still_runs() {
    let registrations = AtomicUsize::new(0);
    let server = spawn_server(move |_, args, stream| match args[0].as_slice() {
        b"SUBSCRIBE" => {
            write(stream, &simple("OK"));
            Step::Continue
        }
        // The node keeps the first registration but the reply never arrives.
        b"CQ_REGISTER" if registrations.fetch_add(1, Ordering::SeqCst) == 0 => Step::Hangup,
        b"CQ_REGISTER" => {
            let name = String::from_utf8_lossy(&args[2]).into_owned();
            write(stream, &RespValue::error("EXISTS", &name));
            Step::Continue
        }
        _ => basic_reply(args, stream),
    });
    let (locator, _) = spawn_locator(server, None);
    let client = GridClient::connect(ClientConfig {
        subscription_enabled: true,
        ..config(locator)
    })
    .expect("connect");
    let region = client.region::<i32, String>("r").expect("region");

    let (listener, _events) = ChannelListener::<i32, String>::new();
    let cq = region.new_named_cq("kept", "this = 'X'", listener).expect("create");
    cq.execute().expect("retried registration");
    assert_eq!(cq.state(), CqState::Running);

    // Without a lost reply a duplicate is still an error.
    let (listener, _events) = ChannelListener::<i32, String>::new();
    let twin = region.new_named_cq("twin", "this = 'X'", listener).expect("create");
    match twin.execute() {
        Err(ClientError::CqExists(name)) => assert_eq!(name, "twin"),
        other => panic!("expected CqExists, got {:?}", other),
    }
    assert_eq!(twin.state(), CqState::Closed);
    client.close();
}
