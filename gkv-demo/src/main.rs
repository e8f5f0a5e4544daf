//! Walks through the five client usage patterns against a grid:
//! string get/put, `SELECT *`, a continuous query, auto-serialized
//! get/put and a `toString()` projection.
//!
//! Settings come from the JSON file named by `GKV_CONFIG`, if set. By
//! default the demo starts its own node and connects to it.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gkv_client::{
    auto_region_value, AutoSerializable, ChannelListener, ClientConfig, CodecResult, Endpoint,
    FieldReader, FieldWriter, GridClient, SerializationStrategy, Value,
};
use gkv_server::{BackgroundNode, ServerConfig};

const EVENT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoConfig {
    #[serde(flatten)]
    client: ClientConfig,
    region: String,
    /// Start an in-process node and ignore the configured locators.
    embedded_node: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            client: ClientConfig {
                subscription_enabled: true,
                log_level: "info".to_string(),
                serialization: SerializationStrategy::Auto {
                    pattern: r"example\..*".to_string(),
                },
                ..ClientConfig::default()
            },
            region: "example-region".to_string(),
            embedded_node: true,
        }
    }
}

impl DemoConfig {
    fn load() -> Result<Self> {
        let Some(path) = std::env::var_os("GKV_CONFIG") else {
            return Ok(DemoConfig::default());
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.to_string_lossy()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.to_string_lossy()))
    }
}

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

fn main() -> Result<()> {
    let mut config = DemoConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.client.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let _node = if config.embedded_node {
        let node = BackgroundNode::start(ServerConfig::ephemeral([config.region.clone()]))
            .context("starting embedded node")?;
        let locator = node.locator_addr();
        config.client.locators = vec![Endpoint::new(locator.ip().to_string(), locator.port())];
        Some(node)
    } else {
        None
    };

    let client = GridClient::connect(config.client.clone()).context("connecting to grid")?;
    let outcome = run(&client, &config.region);
    client.close();
    outcome
}

fn run(client: &GridClient, region_name: &str) -> Result<()> {
    let region = client.region::<i32, Value>(region_name)?;

    // 1. get/put of a string value
    region.put(&1, &Value::from("one"))?;
    let value = region.get(&1)?;
    info!(key = 1, value = ?value.as_ref().map(ToString::to_string), "get after put");

    // 2. SELECT * over the region
    let query = format!("SELECT * FROM /{}", region_name);
    for row in region.query::<Value>(&query)? {
        info!(%row, "query row");
    }

    // 3. continuous query observing one put
    let (listener, events) = ChannelListener::new();
    let cq = region.new_cq(&query, listener)?;
    cq.execute()?;
    region.put(&2, &Value::from("two"))?;
    let event = events
        .recv_timeout(EVENT_WAIT)
        .context("no continuous query event within the wait window")?;
    info!(
        cq = event.cq_name(),
        operation = %event.operation(),
        key = ?event.key(),
        value = ?event.new_value().map(ToString::to_string),
        "continuous query event"
    );
    cq.close()?;

    // 4. auto-serialized object put/get
    let objects = client.region::<i32, AutoSerializableObject>(region_name)?;
    let object = AutoSerializableObject {
        value: "auto-serialized".to_string(),
    };
    objects.put(&3, &object)?;
    match objects.get(&3)? {
        Some(read) if read == object => info!(value = %read.value, "auto-serialized round trip"),
        other => bail!("auto-serialized object came back as {:?}", other),
    }

    // 5. toString() projection over the object
    let rendered = format!("SELECT e.toString() FROM /{} e", region_name);
    for row in objects.query::<String>(&rendered)? {
        info!(%row, "rendered row");
    }
    Ok(())
}
