//! # GridKV Client
//!
//! Purpose: Reach a cache grid through its locators and work with its
//! regions: typed get/put, OQL-style queries and continuous queries whose
//! change events are pushed back to the client.
//!
//! ## Design Principles
//! 1. **Blocking Facade**: Every call blocks the caller; only CQ delivery
//!    runs on a background thread.
//! 2. **Object Pool Pattern**: One bounded socket pool per client, shared by
//!    all regions and CQs.
//! 3. **Explicit Serialization**: Values are encoded by declared field lists
//!    or application codecs; nothing is discovered by reflection.
//! 4. **Protocol Clarity**: RESP2 framing shared with the node via `gkv-common`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gkv_client::{ClientConfig, Endpoint, GridClient};
//!
//! let config = ClientConfig::with_locator(Endpoint::new("127.0.0.1", 10334));
//! let client = GridClient::connect(config)?;
//! let region = client.region::<i32, String>("example-region")?;
//! region.put(&1, &"one".to_string())?;
//! assert_eq!(region.get(&1)?, Some("one".to_string()));
//! client.close();
//! # Ok::<(), gkv_client::ClientError>(())
//! ```

mod client;
mod codec;
mod config;
mod cq;
mod locator;
mod pool;
mod query;
mod region;
mod subscription;

pub use client::{ClientError, ClientResult, GridClient};
pub use codec::{
    AutoSerializable, Codec, DataSerializable, FieldReader, FieldWriter, RegionKey, RegionValue,
    TypeKind, Value,
};
pub use config::{ClientConfig, Endpoint, RetryPolicy, SerializationStrategy};
pub use cq::{ChannelListener, CqEvent, CqHandle, CqListener, CqState};
pub use query::ResultSet;
pub use region::Region;

pub use gkv_common::{
    CodecError, CodecResult, CqOperation, FieldValue, ObjectInstance, WireValue,
    DEFAULT_LOCATOR_PORT,
};
