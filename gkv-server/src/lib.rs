//! # GridKV Reference Node
//!
//! Purpose: A small grid node and locator speaking the GridKV wire
//! protocol, for tests and local demos.
//!
//! It keeps regions in memory, evaluates a minimal projection/equality OQL
//! subset and pushes continuous-query events. It has no partitioning,
//! replication, persistence or eviction.
//!
//! ## Architecture
//!
//! ```text
//! locator listener ── LOCATE ──► advertised data address
//! data listener ──► handle_connection ──► dispatch ──► Store (per-region lock)
//!                         │                              │ publish under lock
//!                         └─ SUBSCRIBE ──► writer task ◄─ CqRegistry queue
//! ```

pub mod config;
pub mod cq;
pub mod error;
pub mod locator;
pub mod protocol;
pub mod query;
pub mod server;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::GridNode;

/// Listeners of a started node.
pub struct NodeHandle {
    server_addr: SocketAddr,
    locator_addr: SocketAddr,
    node: Arc<GridNode>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn locator_addr(&self) -> SocketAddr {
        self.locator_addr
    }

    pub fn node(&self) -> &Arc<GridNode> {
        &self.node
    }

    /// Stops accepting; established connections end with the runtime.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Waits until both listeners stop.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Binds both listeners and spawns their accept loops on the current runtime.
pub async fn start(config: ServerConfig) -> ServerResult<NodeHandle> {
    config.validate()?;
    let node = Arc::new(GridNode::new(&config.regions));

    let listener = TcpListener::bind(&config.bind).await?;
    let server_addr = listener.local_addr()?;
    let locator = TcpListener::bind(&config.locator_bind).await?;
    let locator_addr = locator.local_addr()?;
    let advertise = config
        .advertise
        .clone()
        .unwrap_or_else(|| server_addr.to_string());

    info!(
        %server_addr,
        %locator_addr,
        advertise = %advertise,
        regions = ?config.regions,
        "grid node listening"
    );

    let server_task = tokio::spawn({
        let node = node.clone();
        async move {
            if let Err(err) = server::serve(listener, node).await {
                warn!(error = %err, "data listener stopped");
            }
        }
    });
    let locator_task = tokio::spawn(async move {
        if let Err(err) = locator::serve(locator, advertise).await {
            warn!(error = %err, "locator listener stopped");
        }
    });

    Ok(NodeHandle {
        server_addr,
        locator_addr,
        node,
        tasks: vec![server_task, locator_task],
    })
}

/// Upper bound on waiting for node tasks in [`BackgroundNode::shutdown`].
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// A node running on its own runtime, for synchronous callers such as tests.
///
/// Dropping it shuts the runtime down, which closes every connection.
pub struct BackgroundNode {
    runtime: Option<Runtime>,
    handle: NodeHandle,
}

impl BackgroundNode {
    pub fn start(config: ServerConfig) -> ServerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("gkv-node")
            .enable_all()
            .build()?;
        let handle = runtime.block_on(start(config))?;
        Ok(BackgroundNode {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.handle.server_addr()
    }

    pub fn locator_addr(&self) -> SocketAddr {
        self.handle.locator_addr()
    }

    pub fn node(&self) -> &Arc<GridNode> {
        self.handle.node()
    }

    /// Stops the node; every connection is closed when this returns.
    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.handle.abort();
            runtime.shutdown_timeout(SHUTDOWN_WAIT);
        }
    }

    fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.handle.abort();
            runtime.shutdown_background();
        }
    }
}

impl Drop for BackgroundNode {
    fn drop(&mut self) {
        self.stop();
    }
}
