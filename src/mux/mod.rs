//! Request multiplexing across node pipelines.
//!
//! ```text
//!   dispatch ──► load RoutingState (atomic) ──► route by vbucket / ring
//!                                                   │
//!                                                   ▼
//!                                      NodePipeline queue (or dead pipe)
//!
//!   on_new_topology ──► update_lock ──► CAS RoutingState
//!                                         ├─ take over surviving addresses
//!                                         ├─ close removed addresses
//!                                         └─ drain old queues, requeue in order
//! ```
//!
//! Failed requests come back through [`ResponseHandler`](crate::memd::ResponseHandler),
//! where they are mapped to retry reasons and handed to the retry
//! orchestrator.

mod classify;
mod kvmux;
mod state;

pub use kvmux::KvMux;
pub use state::{ConnectionSettings, PipelineSnapshot, RoutingState};
