//! Testing utilities for the routing engine.
//!
//! Everything here runs in memory: [`MockCluster`] plays a set of KV nodes
//! sharing one config, [`MockConnectionProvider`] dials connections to it
//! and [`MockConfigStreamer`] serves scripted HTTP config streams.
//!
//! ```text
//!   KvMux ──► NodePipeline ──► PipelineWorker ──► KvClient
//!                                                   │
//!                                         MockPacketConn (channel)
//!                                                   │
//!                                               MockCluster
//!                                   (config, scripted statuses, delays)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kvroute::testing::{ConfigBuilder, MockCluster, MockConfigStreamer};
//!
//! let config = ConfigBuilder::partitioned("default", &["10.0.0.1", "10.0.0.2"]).vbuckets(1024, 1);
//! let cluster = MockCluster::new(config.build());
//! let agent = RoutingAgent::connect(agent_config, cluster.provider(), MockConfigStreamer::new()).await?;
//! ```

mod configs;
mod mock;

mod agent_tests;
mod client_tests;
mod mux_tests;

pub use configs::{kv_addr, mgmt_endpoint, ConfigBuilder, KV_PORT, KV_TLS_PORT, MGMT_PORT};
pub use mock::{
    DialRecord, MockCluster, MockConfigStreamer, MockConnectionProvider, MockPacketConn,
    RecordedRequest,
};

use std::time::{Duration, Instant};

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
