//! Per-node pipeline: one request queue plus a pool of connection workers.

use super::queue::OpQueue;
use super::request::Request;
use super::worker::PipelineWorker;
use crate::config::PipelineConfig;
use crate::error::{QueueError, Result};
use crate::memd::{KvClient, ResponseHandler};
use crate::types::RouteEndpoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

/// Produces ready-to-use connections for a node.
#[async_trait]
pub trait ClientDialer: Send + Sync {
    async fn dial(&self, endpoint: &RouteEndpoint) -> Result<Arc<KvClient>>;
}

/// Everything a pipeline's workers need, shared by all pipelines of one
/// routing generation.
pub struct PipelineContext {
    pub dialer: Arc<dyn ClientDialer>,
    pub handler: Arc<dyn ResponseHandler>,
    pub config: PipelineConfig,
}

/// The request queue and connection workers for one node address.
///
/// Lifecycle:
/// - created when a topology names a new address, workers started by
///   [`start_workers`](Self::start_workers)
/// - [`takeover`](Self::takeover) of the previous generation's pipeline for
///   the same address moves its workers, and their live connections, here
/// - [`graceful_close`](Self::graceful_close) when the address disappears
pub struct NodePipeline {
    endpoint: RouteEndpoint,
    queue: Arc<OpQueue>,
    max_items: usize,
    context: Option<Arc<PipelineContext>>,
    workers: Mutex<Vec<Arc<PipelineWorker>>>,
}

impl NodePipeline {
    pub fn new(endpoint: RouteEndpoint, context: Arc<PipelineContext>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            queue: Arc::new(OpQueue::new()),
            max_items: context.config.max_queue_size,
            context: Some(context),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// A pipeline with no address and no workers. It only holds requests
    /// until a topology is available.
    pub fn dead(max_items: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoint: RouteEndpoint::new(""),
            queue: Arc::new(OpQueue::new()),
            max_items,
            context: None,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> &str {
        &self.endpoint.address
    }

    pub fn endpoint(&self) -> &RouteEndpoint {
        &self.endpoint
    }

    pub fn server_group(&self) -> &str {
        &self.endpoint.server_group
    }

    pub fn is_seed_node(&self) -> bool {
        self.endpoint.is_seed_node
    }

    pub fn queue(&self) -> &Arc<OpQueue> {
        &self.queue
    }

    pub(crate) fn context(&self) -> Option<&Arc<PipelineContext>> {
        self.context.as_ref()
    }

    /// Queue a request, respecting the queue limit.
    pub fn send_request(&self, req: Arc<Request>) -> std::result::Result<(), QueueError> {
        self.queue.push(req, self.max_items)
    }

    /// Queue a request without a limit. Used for internal redispatch.
    pub fn requeue_request(&self, req: Arc<Request>) -> std::result::Result<(), QueueError> {
        self.queue.push(req, 0)
    }

    /// Spawn workers up to the pool size.
    pub fn start_workers(self: &Arc<Self>) {
        let Some(context) = &self.context else {
            return;
        };
        let mut workers = self.workers.lock();
        while workers.len() < context.config.pool_size {
            let worker = PipelineWorker::new(self.clone());
            tokio::spawn(worker.clone().run());
            workers.push(worker);
        }
    }

    /// Move `old`'s workers to this pipeline and close `old`'s queue.
    pub fn takeover(self: &Arc<Self>, old: &Arc<NodePipeline>) {
        if old.address() != self.address() {
            error!(old = %old.address(), new = %self.address(), "pipeline takeover across addresses");
            for client in old.graceful_close() {
                client.graceful_close(None);
            }
            return;
        }

        let moved = std::mem::take(&mut *old.workers.lock());
        for worker in &moved {
            worker.reassign_to(self.clone());
        }
        debug!(address = %self.address(), workers = moved.len(), "pipeline taken over");
        self.workers.lock().extend(moved);
        old.queue.close();
    }

    /// Stop accepting requests, detach every worker, and return their
    /// connections for the caller to close.
    pub fn graceful_close(&self) -> Vec<Arc<KvClient>> {
        self.queue.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        workers.iter().filter_map(|w| w.close()).collect()
    }

    /// Close the queue and every connection immediately.
    pub async fn close(&self) {
        for client in self.graceful_close() {
            client.close().await;
        }
    }

    /// Hand every queued request to `cb`. The queue must be closed.
    pub fn drain(&self, cb: impl FnMut(Arc<Request>)) {
        self.queue.drain(cb);
    }

    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Live connections currently held by this pipeline's workers.
    pub fn clients(&self) -> Vec<Arc<KvClient>> {
        self.workers
            .lock()
            .iter()
            .filter_map(|w| w.client())
            .collect()
    }

    /// Workers currently attached to this pipeline.
    pub fn workers(&self) -> Vec<Arc<PipelineWorker>> {
        self.workers.lock().clone()
    }
}
