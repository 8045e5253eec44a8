//! Connection worker: pulls requests from its pipeline's queue and writes
//! them to its connection.

use super::node::NodePipeline;
use super::queue::QueueConsumer;
use crate::error::Error;
use crate::memd::{Disposition, KvClient};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where a worker is in its lifecycle.
///
/// ```text
///   Connecting ──dial ok──► Active ──takeover──► DrainingOld
///       ▲                     │                      │
///       └──connection lost────┘◄──new consumer───────┘
///   any ──close──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No live connection.
    Connecting,
    /// Consuming from the current pipeline's queue.
    Active,
    /// Reassigned to a new pipeline; still holding the old consumer until
    /// the next pop notices.
    DrainingOld,
    /// Detached. The loop exits.
    Closed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Connecting => write!(f, "connecting"),
            WorkerState::Active => write!(f, "active"),
            WorkerState::DrainingOld => write!(f, "draining-old"),
            WorkerState::Closed => write!(f, "closed"),
        }
    }
}

struct WorkerInner {
    parent: Option<Arc<NodePipeline>>,
    consumer: Option<Arc<QueueConsumer>>,
    client: Option<Arc<KvClient>>,
    state: WorkerState,
}

enum ConnectOutcome {
    Connected(Arc<KvClient>),
    Failed,
    Stopped,
}

/// One connection slot of a node pipeline.
pub struct PipelineWorker {
    address: String,
    inner: Mutex<WorkerInner>,
    reassigned: Notify,
    stop: CancellationToken,
    exited: CancellationToken,
}

impl PipelineWorker {
    pub(crate) fn new(parent: Arc<NodePipeline>) -> Arc<Self> {
        Arc::new(Self {
            address: parent.address().to_string(),
            inner: Mutex::new(WorkerInner {
                parent: Some(parent),
                consumer: None,
                client: None,
                state: WorkerState::Connecting,
            }),
            reassigned: Notify::new(),
            stop: CancellationToken::new(),
            exited: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn client(&self) -> Option<Arc<KvClient>> {
        self.inner.lock().client.clone()
    }

    /// Resolves once the worker loop has exited.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    /// Attach to `parent`, keeping the connection. The current consumer is
    /// closed so the loop picks up `parent`'s queue on its next pop.
    pub(crate) fn reassign_to(&self, parent: Arc<NodePipeline>) {
        let old_consumer = {
            let mut inner = self.inner.lock();
            if inner.state == WorkerState::Closed {
                return;
            }
            inner.parent = Some(parent);
            if inner.state == WorkerState::Active {
                inner.state = WorkerState::DrainingOld;
            }
            inner.consumer.take()
        };
        if let Some(consumer) = old_consumer {
            consumer.close();
        }
        self.reassigned.notify_waiters();
    }

    /// Detach from the pipeline and stop. Returns the connection, if any,
    /// for the caller to close.
    pub(crate) fn close(&self) -> Option<Arc<KvClient>> {
        let (consumer, client) = {
            let mut inner = self.inner.lock();
            inner.state = WorkerState::Closed;
            inner.parent = None;
            (inner.consumer.take(), inner.client.take())
        };
        if let Some(consumer) = consumer {
            consumer.close();
        }
        self.stop.cancel();
        client
    }

    fn parent(&self) -> Option<Arc<NodePipeline>> {
        self.inner.lock().parent.clone()
    }

    fn consumer(&self) -> Option<Arc<QueueConsumer>> {
        let mut inner = self.inner.lock();
        if inner.state == WorkerState::Closed {
            return None;
        }
        if let Some(consumer) = &inner.consumer {
            return Some(consumer.clone());
        }
        let consumer = inner.parent.as_ref()?.queue().consumer();
        inner.consumer = Some(consumer.clone());
        inner.state = WorkerState::Active;
        Some(consumer)
    }

    fn clear_consumer(&self, consumer: &Arc<QueueConsumer>) {
        let mut inner = self.inner.lock();
        if inner
            .consumer
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, consumer))
        {
            inner.consumer = None;
        }
    }

    fn clear_client(&self, client: &Arc<KvClient>) {
        let mut inner = self.inner.lock();
        if inner.client.as_ref().is_some_and(|c| Arc::ptr_eq(c, client)) {
            inner.client = None;
            if inner.state != WorkerState::Closed {
                inner.state = WorkerState::Connecting;
            }
        }
    }

    fn live_client(&self) -> Option<Arc<KvClient>> {
        self.inner
            .lock()
            .client
            .clone()
            .filter(|c| !c.is_closing())
    }

    async fn connect(&self, attempt: u32) -> ConnectOutcome {
        let Some(parent) = self.parent() else {
            return ConnectOutcome::Stopped;
        };
        let Some(context) = parent.context().cloned() else {
            return ConnectOutcome::Stopped;
        };

        if attempt > 0 {
            let delay = context.config.reconnect_delay(attempt - 1);
            tokio::select! {
                _ = self.stop.cancelled() => return ConnectOutcome::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let dial = tokio::time::timeout(
            context.config.connect_timeout,
            context.dialer.dial(parent.endpoint()),
        );
        let result = tokio::select! {
            _ = self.stop.cancelled() => return ConnectOutcome::Stopped,
            result = dial => result,
        };

        match result {
            Ok(Ok(client)) => {
                let accepted = {
                    let mut inner = self.inner.lock();
                    if inner.state == WorkerState::Closed {
                        false
                    } else {
                        inner.client = Some(client.clone());
                        true
                    }
                };
                if !accepted {
                    client.close().await;
                    return ConnectOutcome::Stopped;
                }
                debug!(address = %self.address, conn_id = %client.conn_id(), "pipeline worker connected");
                ConnectOutcome::Connected(client)
            }
            Ok(Err(e)) => {
                warn!(address = %self.address, attempt, error = %e, "pipeline worker failed to connect");
                ConnectOutcome::Failed
            }
            Err(_) => {
                warn!(address = %self.address, attempt, "pipeline worker connect timed out");
                ConnectOutcome::Failed
            }
        }
    }

    /// Wait for a reassignment after finding the parent's queue closed.
    async fn await_reassignment(&self, consumer: &Arc<QueueConsumer>) {
        let notified = self.reassigned.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let unchanged = self
            .parent()
            .is_some_and(|p| Arc::ptr_eq(p.queue(), consumer.queue()));
        if !unchanged {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }

    pub(crate) async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let client = match self.live_client() {
                Some(client) => client,
                None => match self.connect(attempt).await {
                    ConnectOutcome::Connected(client) => {
                        attempt = 0;
                        client
                    }
                    ConnectOutcome::Failed => {
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    ConnectOutcome::Stopped => break,
                },
            };

            let Some(consumer) = self.consumer() else {
                break;
            };

            let popped = tokio::select! {
                req = consumer.pop() => req,
                _ = client.closed() => {
                    self.clear_client(&client);
                    continue;
                }
                _ = self.stop.cancelled() => break,
            };

            let Some(req) = popped else {
                let queue_closed = !consumer.is_closed();
                self.clear_consumer(&consumer);
                if queue_closed {
                    self.await_reassignment(&consumer).await;
                }
                continue;
            };

            match client.send_request(req.clone()).await {
                Ok(()) | Err(Error::Cancelled) => {}
                Err(err) => {
                    debug!(address = %self.address, error = %err, "write failed, dropping connection");
                    client.close().await;
                    self.clear_client(&client);
                    self.clear_consumer(&consumer);

                    let handler = self
                        .parent()
                        .and_then(|p| p.context().map(|c| c.handler.clone()));
                    let disposition = match handler {
                        Some(handler) => handler.handle_error(None, &req, err),
                        None => Disposition::Fail(err),
                    };
                    if let Disposition::Fail(err) = disposition {
                        req.try_complete(Err(err));
                    }
                }
            }
        }

        debug!(address = %self.address, "pipeline worker exited");
        self.exited.cancel();
    }
}
