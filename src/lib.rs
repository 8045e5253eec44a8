//! Topology-aware request routing for clustered key-value stores.
//!
//! This crate routes key-value requests to the node that owns each key and
//! keeps that routing current while the cluster changes underneath it:
//! - **vbucket maps** and **ketama rings** resolve keys to nodes
//! - a **topology manager** applies configs in revision order
//! - a **mux** swaps routing tables atomically, keeping connections to
//!   surviving nodes and re-dispatching requests left on removed ones
//! - **pollers** fetch configs in-protocol, falling back to HTTP streaming
//!
//! # Example
//!
//! ```rust,no_run
//! use kvroute::{AgentConfig, RoutingAgent, Request};
//! use kvroute::memd::{Command, TcpConnectionProvider};
//! use kvroute::polling::ReqwestConfigStreamer;
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::new("travel", vec!["10.0.0.1:11210".to_string()])
//!         .with_seed_mgmt_endpoints(vec!["http://10.0.0.1:8091".to_string()]);
//!
//!     let provider = Arc::new(TcpConnectionProvider::new("travel", Duration::from_secs(7)));
//!     let streamer = Arc::new(ReqwestConfigStreamer::new(Duration::from_secs(5))?);
//!     let agent = RoutingAgent::connect(config, provider, streamer).await?;
//!     agent.wait_until_ready(Instant::now() + Duration::from_secs(10)).await?;
//!
//!     let (req, pending) = Request::builder(Command::Get).key("airline_10").build();
//!     agent.dispatch(req)?;
//!     let resp = pending.await?;
//!     println!("served by {}", resp.source_addr);
//!
//!     agent.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │         RoutingAgent         │
//!                 └──────────────────────────────┘
//!                    │            │           │
//!                    ▼            ▼           ▼
//!          ┌──────────────┐ ┌──────────┐ ┌──────────────────┐
//!          │ CCCP / HTTP  │ │ Topology │ │      KvMux       │
//!          │   pollers    │─▶ Manager  │─▶ (RoutingState)   │
//!          └──────────────┘ └──────────┘ └──────────────────┘
//!                                           │           │
//!                                           ▼           ▼
//!                                  ┌──────────────┐ ┌──────────┐
//!                                  │ NodePipeline │ │ dead pipe│
//!                                  │  + workers   │ └──────────┘
//!                                  └──────────────┘
//!                                           │
//!                                           ▼
//!                                      KvClient (memd)
//! ```
//!
//! # Ordering
//!
//! - A topology is applied only if `(rev_epoch, rev_id)` is newer than the
//!   current one, or the bucket type moves from unknown to known
//! - Requests are never lost across a swap: each is completed or re-routed
//!   exactly once

pub mod agent;
pub mod config;
pub mod error;
pub mod memd;
pub mod mux;
pub mod partitioning;
pub mod pipeline;
pub mod polling;
pub mod retry;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export main types for convenience
pub use agent::RoutingAgent;
pub use config::{AgentConfig, PipelineConfig, PollerConfig};
pub use error::{Error, KvError, Result};
pub use types::{
    AuthMechanism, AuthProvider, BucketCapability, BucketType, CapabilityStatus, Credentials,
    PasswordAuth, RouteEndpoint, TlsSettings,
};

// Re-export routing types
pub use mux::{KvMux, PipelineSnapshot};
pub use partitioning::{KetamaRing, VbucketMap};
pub use pipeline::{PendingResponse, Request, RequestBuilder, Response};
pub use retry::{BestEffortRetryStrategy, FailFastRetryStrategy, RetryReason, RetryStrategy};
pub use topology::{BucketConfig, RouteConfig, TopologyManager};
