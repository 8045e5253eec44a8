//! FIFO request queue shared by the workers of one node pipeline.

use super::request::{next_owner_token, Request};
use crate::error::QueueError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::error;

struct QueueInner {
    items: VecDeque<Arc<Request>>,
    open: bool,
}

/// A closable FIFO of requests.
///
/// Requests are claimed with the queue's owner token on push and released
/// on pop or drain. Once closed, pops return `None` immediately and the
/// remaining items are left for [`OpQueue::drain`], which is how a replaced
/// pipeline hands its backlog back to the mux.
pub struct OpQueue {
    token: u64,
    inner: Mutex<QueueInner>,
    signal: Notify,
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            token: next_owner_token(),
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                open: true,
            }),
            signal: Notify::new(),
        }
    }

    /// Push a request. A `max_items` of 0 means unbounded.
    pub fn push(&self, req: Arc<Request>, max_items: usize) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(QueueError::Closed);
            }
            if max_items > 0 && inner.items.len() >= max_items {
                let token = self.token;
                inner.items.retain(|r| {
                    if r.is_completed() {
                        r.release(token);
                        false
                    } else {
                        true
                    }
                });
                if inner.items.len() >= max_items {
                    return Err(QueueError::Full);
                }
            }
            if !req.try_claim(self.token) {
                return Err(if req.is_completed() {
                    QueueError::Cancelled
                } else {
                    QueueError::AlreadyQueued
                });
            }
            inner.items.push_back(req);
        }
        self.signal.notify_waiters();
        Ok(())
    }

    /// Remove a specific request. Returns false if it is not queued here.
    pub fn remove(&self, req: &Arc<Request>) -> bool {
        let mut inner = self.inner.lock();
        if !req.release(self.token) {
            return false;
        }
        inner.items.retain(|r| !Arc::ptr_eq(r, req));
        true
    }

    /// Create a consumer handle.
    pub fn consumer(self: &Arc<Self>) -> Arc<QueueConsumer> {
        Arc::new(QueueConsumer {
            queue: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn pop(&self, consumer: &QueueConsumer) -> Option<Arc<Request>> {
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if !inner.open || consumer.is_closed() {
                    return None;
                }
                while let Some(req) = inner.items.pop_front() {
                    if req.release(self.token) && !req.is_completed() {
                        return Some(req);
                    }
                }
            }

            notified.await;
        }
    }

    /// Stop accepting pushes and wake every consumer.
    pub fn close(&self) {
        self.inner.lock().open = false;
        self.signal.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand every live queued request to `cb`. Only valid on a closed queue.
    pub fn drain(&self, mut cb: impl FnMut(Arc<Request>)) {
        let items = {
            let mut inner = self.inner.lock();
            if inner.open {
                error!("attempted to drain an open queue");
                return;
            }
            std::mem::take(&mut inner.items)
        };

        for req in items {
            if req.release(self.token) && !req.is_completed() {
                cb(req);
            }
        }
    }
}

/// One worker's handle on a queue. Closing it makes that worker's pending
/// and future pops return `None` without affecting other consumers.
pub struct QueueConsumer {
    queue: Arc<OpQueue>,
    closed: AtomicBool,
}

impl QueueConsumer {
    /// Wait for the next request. `None` means this consumer or its queue
    /// was closed.
    pub async fn pop(&self) -> Option<Arc<Request>> {
        self.queue.pop(self).await
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> &Arc<OpQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memd::Command;
    use std::time::Duration;

    fn request(key: &str) -> Arc<Request> {
        Request::builder(Command::Get).key(key.to_string()).build().0
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Arc::new(OpQueue::new());
        for key in ["a", "b", "c"] {
            queue.push(request(key), 0).unwrap();
        }
        let consumer = queue.consumer();
        for key in ["a", "b", "c"] {
            let req = consumer.pop().await.unwrap();
            assert_eq!(req.key().as_ref(), key.as_bytes());
            assert!(!req.is_owned());
        }
    }

    #[test]
    fn test_full_and_unbounded() {
        let queue = OpQueue::new();
        queue.push(request("a"), 1).unwrap();
        assert_eq!(queue.push(request("b"), 1), Err(QueueError::Full));
        queue.push(request("c"), 0).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_cancelled_items_free_capacity() {
        let queue = OpQueue::new();
        let first = request("a");
        queue.push(first.clone(), 2).unwrap();
        queue.push(request("b"), 2).unwrap();
        assert_eq!(queue.push(request("c"), 2), Err(QueueError::Full));

        first.cancel(Error::Cancelled);
        queue.push(request("d"), 2).unwrap();
        assert_eq!(queue.len(), 2);
        assert!(!first.is_owned());
        assert_eq!(queue.push(request("e"), 2), Err(QueueError::Full));
    }

    #[test]
    fn test_push_rejects_owned_and_cancelled() {
        let a = OpQueue::new();
        let b = OpQueue::new();
        let req = request("k");
        a.push(req.clone(), 0).unwrap();
        assert_eq!(b.push(req.clone(), 0), Err(QueueError::AlreadyQueued));

        let cancelled = request("c");
        cancelled.cancel(Error::Cancelled);
        assert_eq!(b.push(cancelled, 0), Err(QueueError::Cancelled));
    }

    #[test]
    fn test_closed_rejects_push() {
        let queue = OpQueue::new();
        queue.close();
        assert_eq!(queue.push(request("a"), 0), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(OpQueue::new());
        let consumer = queue.consumer();
        let waiter = tokio::spawn(async move { consumer.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(request("late"), 0).unwrap();

        let req = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(req.key().as_ref(), b"late");
    }

    #[tokio::test]
    async fn test_consumer_close_wakes_pop() {
        let queue = Arc::new(OpQueue::new());
        let consumer = queue.consumer();
        let other = queue.consumer();
        let c = consumer.clone();
        let waiter = tokio::spawn(async move { c.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer.close();
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());

        queue.push(request("x"), 0).unwrap();
        assert!(other.pop().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_queue_leaves_items_for_drain() {
        let queue = Arc::new(OpQueue::new());
        queue.push(request("a"), 0).unwrap();
        queue.push(request("b"), 0).unwrap();
        let cancelled = request("c");
        queue.push(cancelled.clone(), 0).unwrap();
        cancelled.cancel(Error::Cancelled);
        queue.close();

        assert!(queue.consumer().pop().await.is_none());

        let mut drained = Vec::new();
        queue.drain(|req| drained.push(req));
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|r| !r.is_owned()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_open_queue_is_refused() {
        let queue = OpQueue::new();
        queue.push(request("a"), 0).unwrap();
        let mut count = 0;
        queue.drain(|_| count += 1);
        assert_eq!(count, 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_skips_cancelled() {
        let queue = Arc::new(OpQueue::new());
        let first = request("first");
        queue.push(first.clone(), 0).unwrap();
        queue.push(request("second"), 0).unwrap();
        first.cancel(Error::Cancelled);

        let req = queue.consumer().pop().await.unwrap();
        assert_eq!(req.key().as_ref(), b"second");
    }

    #[test]
    fn test_remove() {
        let queue = OpQueue::new();
        let req = request("a");
        queue.push(req.clone(), 0).unwrap();
        assert!(queue.remove(&req));
        assert!(!queue.remove(&req));
        assert!(queue.is_empty());
    }
}
