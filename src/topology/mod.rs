//! Cluster topology: config parsing, routing snapshots, and the manager
//! that fences and applies them.
//!
//! ```text
//!   poller ──BucketConfig──► TopologyManager::propose_topology
//!                               │ build RouteConfig (pinned network type)
//!                               │ validate, fence on (epoch, rev)
//!                               ▼
//!                           watchers (mux, poller controller)
//! ```

mod bucket_config;
mod manager;
mod route_config;

pub use bucket_config::{
    AlternateAddress, BucketConfig, ConfigNode, ConfigNodeExt, ServicePorts, VbucketServerMap,
};
pub use manager::{ConfigRefresher, TopologyManager, TopologyWatcher, WatcherId};
pub use route_config::RouteConfig;
