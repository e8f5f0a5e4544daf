//! End-to-end tests against an in-process grid node.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use gkv_client::{
    auto_region_value, data_region_value, AutoSerializable, ChannelListener, ClientConfig,
    ClientError, CodecError, CodecResult, CqOperation, CqState, DataSerializable, Endpoint,
    FieldReader, FieldWriter, GridClient, SerializationStrategy, Value,
};
use gkv_common::{encode_value, read_response, RespValue};
use gkv_server::{BackgroundNode, ServerConfig};

const REGION: &str = "example-region";
const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq)]
struct AutoSerializableObject {
    value: String,
}

impl AutoSerializable for AutoSerializableObject {
    const TYPE_NAME: &'static str = "example.AutoSerializableObject";

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer.write_string("value", &self.value);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> CodecResult<Self> {
        Ok(AutoSerializableObject {
            value: reader.read_string("value")?,
        })
    }
}

auto_region_value!(AutoSerializableObject);

#[derive(Debug, Clone, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

impl DataSerializable for Point {
    const TYPE_NAME: &'static str = "geo.Point";

    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.x.to_be_bytes());
        out.extend_from_slice(&self.y.to_be_bytes());
    }

    fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() != 8 {
            return Err(CodecError::Malformed(format!("point needs 8 bytes, got {}", bytes.len())));
        }
        let mut x = [0u8; 4];
        let mut y = [0u8; 4];
        x.copy_from_slice(&bytes[..4]);
        y.copy_from_slice(&bytes[4..]);
        Ok(Point {
            x: i32::from_be_bytes(x),
            y: i32::from_be_bytes(y),
        })
    }
}

data_region_value!(Point);

fn start_node() -> BackgroundNode {
    BackgroundNode::start(ServerConfig::ephemeral([REGION])).expect("start node")
}

fn connect(node: &BackgroundNode, subscriptions: bool) -> GridClient {
    let locator = node.locator_addr();
    let config = ClientConfig {
        subscription_enabled: subscriptions,
        serialization: SerializationStrategy::Auto {
            pattern: r"example\..*".to_string(),
        },
        close_grace: Duration::from_millis(200),
        ..ClientConfig::with_locator(Endpoint::new(locator.ip().to_string(), locator.port()))
    };
    GridClient::connect(config).expect("connect")
}

#[test]
fn put_then_get_round_trips() {
    let node = start_node();
    let client = connect(&node, false);
    let region = client.region::<i32, String>(REGION).expect("region");

    region.put(&1, &"X".to_string()).expect("put");
    assert_eq!(region.get(&1).expect("get"), Some("X".to_string()));
    assert_eq!(region.get(&2).expect("get"), None);

    region.put(&1, &"Y".to_string()).expect("overwrite");
    assert_eq!(region.get(&1).expect("get"), Some("Y".to_string()));
    client.close();
}

#[test]
fn remove_and_invalidate_report_presence() {
    let node = start_node();
    let client = connect(&node, false);
    let region = client.region::<String, i64>(REGION).expect("region");
    let key = "counter".to_string();

    region.put(&key, &7).expect("put");
    assert!(region.invalidate(&key).expect("invalidate"));
    assert!(!region.invalidate(&key).expect("invalidate again"));
    assert_eq!(region.get(&key).expect("get"), None);

    assert!(region.remove(&key).expect("remove"));
    assert!(!region.remove(&key).expect("remove again"));
}

#[test]
fn queries_select_and_filter_values() {
    let node = start_node();
    let client = connect(&node, false);
    let region = client.region::<i32, String>(REGION).expect("region");
    region.put(&1, &"X".to_string()).expect("put");
    region.put(&2, &"Y".to_string()).expect("put");

    let all: Vec<String> = region
        .query::<String>("SELECT * FROM /example-region")
        .expect("select all")
        .collect();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&"X".to_string()));

    let filtered: Vec<String> = region.query::<String>("this = 'X'").expect("predicate").collect();
    assert_eq!(filtered, vec!["X".to_string()]);

    let unscoped = client
        .query::<String>("select * from /example-region v where v = 'Y'")
        .expect("client query");
    assert_eq!(unscoped.len(), 1);
}

#[test]
fn query_errors_are_reported() {
    let node = start_node();
    let client = connect(&node, false);
    let region = client.region::<i32, String>(REGION).expect("region");

    assert!(matches!(region.query::<String>("  "), Err(ClientError::Query(_))));
    assert!(matches!(
        client.query::<String>("SELECT * FROM /missing"),
        Err(ClientError::Query(message)) if message.contains("/missing")
    ));
    assert!(matches!(
        client.query::<String>("SELECT FROM"),
        Err(ClientError::Query(_))
    ));
}

#[test]
fn missing_region_is_unavailable() {
    let node = start_node();
    let client = connect(&node, false);
    match client.region::<i32, String>("no-such-region") {
        Err(ClientError::RegionUnavailable { region, .. }) => assert_eq!(region, "no-such-region"),
        other => panic!("expected RegionUnavailable, got {:?}", other),
    }
}

#[test]
fn auto_serialized_objects_round_trip_and_query() {
    let node = start_node();
    let client = connect(&node, false);
    let typed = client
        .region::<i32, AutoSerializableObject>(REGION)
        .expect("region");
    let object = AutoSerializableObject {
        value: "hello".to_string(),
    };
    typed.put(&1, &object).expect("put");
    assert_eq!(typed.get(&1).expect("get"), Some(object.clone()));

    let rendered: Vec<String> = typed
        .query::<String>("SELECT e.toString() FROM /example-region e")
        .expect("toString")
        .collect();
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].contains("hello"), "{}", rendered[0]);

    let dynamic = client.region::<i32, Value>(REGION).expect("region");
    let rows: Vec<Value> = dynamic.query::<Value>("this.value = 'hello'").expect("by field").collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].to_auto::<AutoSerializableObject>().expect("typed"), object);
}

#[test]
fn unregistered_types_are_rejected() {
    let node = start_node();
    let client = connect(&node, false);
    let points = client.region::<i32, Point>(REGION).expect("region");
    assert!(matches!(
        points.put(&1, &Point { x: 1, y: 2 }),
        Err(ClientError::Serialization(CodecError::Unregistered(_)))
    ));

    client.codec().register_data::<Point>();
    points.put(&1, &Point { x: 1, y: 2 }).expect("put");
    assert_eq!(points.get(&1).expect("get"), Some(Point { x: 1, y: 2 }));
}

#[test]
fn continuous_query_sees_each_change_once() {
    let node = start_node();
    let client = connect(&node, true);
    let region = client.region::<i32, String>(REGION).expect("region");

    let (listener, events) = ChannelListener::new();
    let cq = region
        .new_cq("SELECT * FROM /example-region", listener)
        .expect("create");
    assert_eq!(cq.state(), CqState::Created);
    cq.execute().expect("execute");
    assert_eq!(cq.state(), CqState::Running);
    assert_eq!(client.running_cqs(), vec![cq.name().to_string()]);

    region.put(&1, &"a".to_string()).expect("put");
    region.put(&1, &"b".to_string()).expect("put");
    region.remove(&1).expect("remove");

    let created = events.recv_timeout(WAIT).expect("create event");
    assert_eq!(created.operation(), CqOperation::Create);
    assert_eq!(created.key(), Some(&1));
    assert_eq!(created.new_value(), Some(&"a".to_string()));
    assert_eq!(created.old_value(), None);

    let updated = events.recv_timeout(WAIT).expect("update event");
    assert_eq!(updated.operation(), CqOperation::Update);
    assert_eq!(updated.new_value(), Some(&"b".to_string()));
    assert_eq!(updated.old_value(), Some(&"a".to_string()));

    let destroyed = events.recv_timeout(WAIT).expect("destroy event");
    assert_eq!(destroyed.operation(), CqOperation::Destroy);
    assert_eq!(destroyed.new_value(), None);

    assert!(events.recv_timeout(QUIET).is_err());
    client.close();
}

#[test]
fn predicate_cq_tracks_result_set_membership() {
    let node = start_node();
    let client = connect(&node, true);
    let region = client.region::<i32, String>(REGION).expect("region");

    let (listener, events) = ChannelListener::new();
    let cq = region.new_named_cq("only-x", "this = 'X'", listener).expect("create");
    cq.execute().expect("execute");

    region.put(&1, &"Y".to_string()).expect("put");
    region.put(&1, &"X".to_string()).expect("put");
    region.put(&1, &"Y".to_string()).expect("put");

    let entered = events.recv_timeout(WAIT).expect("enter");
    assert_eq!(entered.operation(), CqOperation::Create);
    assert_eq!(entered.cq_name(), "only-x");
    let left = events.recv_timeout(WAIT).expect("leave");
    assert_eq!(left.operation(), CqOperation::Destroy);
    assert_eq!(left.old_value(), Some(&"X".to_string()));
    assert!(events.recv_timeout(QUIET).is_err());
}

#[test]
fn closed_cq_stops_receiving_events() {
    let node = start_node();
    let client = connect(&node, true);
    let region = client.region::<i32, String>(REGION).expect("region");

    let (listener, events) = ChannelListener::new();
    let cq = region.new_cq("SELECT * FROM /example-region", listener).expect("create");
    cq.execute().expect("execute");
    cq.close().expect("close");
    cq.close().expect("close is idempotent");
    assert_eq!(cq.state(), CqState::Closed);
    assert!(client.running_cqs().is_empty());

    region.put(&1, &"a".to_string()).expect("put");
    assert!(events.recv_timeout(QUIET).is_err());

    assert!(matches!(
        cq.execute(),
        Err(ClientError::InvalidCqState { state: CqState::Closed, .. })
    ));
}

#[test]
fn put_racing_close_delivers_at_most_one_event() {
    let node = start_node();
    let client = connect(&node, true);
    let region = client.region::<i32, String>(REGION).expect("region");

    let (listener, events) = ChannelListener::new();
    let cq = region.new_cq("SELECT * FROM /example-region", listener).expect("create");
    cq.execute().expect("execute");

    let start = Barrier::new(2);
    thread::scope(|scope| {
        scope.spawn(|| {
            start.wait();
            region.put(&1, &"racing".to_string()).expect("racing put");
        });
        start.wait();
        cq.close().expect("close");
    });

    let mut delivered = 0;
    while events.recv_timeout(QUIET).is_ok() {
        delivered += 1;
    }
    assert!(delivered <= 1, "{} events after a racing close", delivered);
    assert_eq!(node.node().cqs().cq_count(client.client_id()), 0);

    region.put(&2, &"late".to_string()).expect("put");
    assert!(events.recv_timeout(QUIET).is_err());
}

#[test]
fn cq_names_are_unique_per_client() {
    let node = start_node();
    let client = connect(&node, true);
    let region = client.region::<i32, String>(REGION).expect("region");

    let (first, _first_events) = ChannelListener::new();
    let _cq = region.new_named_cq("dup", "this = 'X'", first).expect("create");
    let (second, _second_events) = ChannelListener::<i32, String>::new();
    assert!(matches!(
        region.new_named_cq("dup", "this = 'Y'", second),
        Err(ClientError::CqExists(name)) if name == "dup"
    ));
}

#[test]
fn cq_needs_subscriptions() {
    let node = start_node();
    let client = connect(&node, false);
    let region = client.region::<i32, String>(REGION).expect("region");

    let (listener, _events) = ChannelListener::new();
    let cq = region.new_cq("this = 'X'", listener).expect("create");
    assert!(matches!(cq.execute(), Err(ClientError::SubscriptionDisabled)));
}

#[test]
fn undecodable_value_fails_predicate_cq() {
    let node = start_node();
    let client = connect(&node, true);
    client.codec().register_data::<Point>();

    let values = client.region::<i32, Value>(REGION).expect("region");
    let (listener, events) = ChannelListener::new();
    let cq = values.new_cq("this.x = 1", listener).expect("create");
    cq.execute().expect("execute");

    let points = client.region::<i32, Point>(REGION).expect("region");
    points.put(&1, &Point { x: 1, y: 2 }).expect("put");

    let failure = events.recv_timeout(WAIT).expect("error event");
    assert_eq!(failure.operation(), CqOperation::Error);
    assert!(failure.error_message().is_some());
    assert!(events.recv_timeout(QUIET).is_err());
    assert_eq!(cq.state(), CqState::Closed);
}

#[test]
fn node_shutdown_fails_running_cqs() {
    let node = start_node();
    let client = connect(&node, true);
    let region = client.region::<i32, String>(REGION).expect("region");

    let (listener, events) = ChannelListener::new();
    let cq = region.new_cq("SELECT * FROM /example-region", listener).expect("create");
    cq.execute().expect("execute");

    node.shutdown();
    let failure = events.recv_timeout(WAIT).expect("error event");
    assert_eq!(failure.operation(), CqOperation::Error);
    assert_eq!(cq.state(), CqState::Closed);
    client.close();
}

#[test]
fn closed_client_rejects_operations() {
    let node = start_node();
    let client = connect(&node, true);
    let region = client.region::<i32, String>(REGION).expect("region");

    client.close();
    client.close();
    assert!(client.is_closed());
    assert!(matches!(region.get(&1), Err(ClientError::Closed)));
    let (listener, _events) = ChannelListener::new();
    assert!(matches!(
        region.new_cq("this = 'X'", listener),
        Err(ClientError::Closed)
    ));
}

/// Locator sending the first lookup to `first` and every later one to `then`.
fn failover_locator(first: SocketAddr, then: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind locator");
    let addr = listener.local_addr().expect("locator addr");
    thread::spawn(move || {
        for (index, stream) in listener.incoming().enumerate() {
            let Ok(mut stream) = stream else { break };
            let target = if index == 0 { first } else { then };
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = Vec::new();
            while read_response(&mut reader, &mut line).is_ok() {
                let mut out = Vec::new();
                encode_value(&RespValue::bulk(target.to_string()), &mut out);
                if stream.write_all(&out).is_err() {
                    break;
                }
            }
        }
    });
    addr
}

#[test]
fn subscription_follows_the_client_to_a_new_server() {
    let first = start_node();
    let second = start_node();
    let locator = failover_locator(first.server_addr(), second.server_addr());
    let client = GridClient::connect(ClientConfig {
        subscription_enabled: true,
        close_grace: Duration::from_millis(200),
        ..ClientConfig::with_locator(Endpoint::new("127.0.0.1", locator.port()))
    })
    .expect("connect");
    let region = client.region::<i32, String>(REGION).expect("region");
    region.put(&1, &"a".to_string()).expect("put on the first node");

    first.shutdown();
    region.put(&2, &"b".to_string()).expect("put after failover");

    let (listener, events) = ChannelListener::new();
    let cq = region.new_cq("SELECT * FROM /example-region", listener).expect("create");
    cq.execute().expect("execute on the second node");
    assert_eq!(second.node().cqs().cq_count(client.client_id()), 1);

    region.put(&3, &"c".to_string()).expect("put");
    let event = events.recv_timeout(WAIT).expect("event from the second node");
    assert_eq!(event.operation(), CqOperation::Create);
    assert_eq!(event.key(), Some(&3));
    assert_eq!(event.new_value(), Some(&"c".to_string()));
    client.close();
}
