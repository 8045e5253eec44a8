//! Node pipelines: per-node request queues drained by connection workers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ NodePipeline (one per KV address)                         │
//! │                                                           │
//! │   send_request ──► OpQueue ──► QueueConsumer ──► Worker 1 │──► KvClient ──► node
//! │   requeue_request ─┘      └──► QueueConsumer ──► Worker N │──► KvClient ──► node
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! When a new topology keeps an address, the new pipeline takes over the old
//! one: workers are reattached and the old queue is closed. Each worker's
//! pending pop returns `None`, it fetches a consumer on the new queue, and
//! its connection stays open throughout.

mod node;
mod queue;
mod request;
mod worker;

pub use node::{ClientDialer, NodePipeline, PipelineContext};
pub use queue::{OpQueue, QueueConsumer};
pub(crate) use request::{next_owner_token, PINNED_ADDRESS_REPLICA};
pub use request::{
    PendingResponse, Request, RequestBuilder, RequestResult, Response, ResponseStream,
};
pub use worker::{PipelineWorker, WorkerState};
