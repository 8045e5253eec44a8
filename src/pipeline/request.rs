//! Routable requests and their single-fulfillment completion handles.
//!
//! A [`Request`] is shared (`Arc`) between the caller's handle, the queue or
//! connection that currently owns it, and any retry timer. Two atomics carry
//! its lifecycle:
//!
//! - `owner`: the token of the queue or connection holding it, `0` if none.
//!   Ownership moves by compare-and-swap, so at most one holder exists.
//! - `completed`: set exactly once by whichever path finishes the request
//!   first; every later completion attempt is a no-op.

use crate::error::{Error, KvError};
use crate::memd::{Command, Packet, Status};
use crate::retry::{default_retry_strategy, RetryReason, RetryStrategy};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OWNER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Allocates a token identifying a queue or connection as request owner.
pub(crate) fn next_owner_token() -> u64 {
    NEXT_OWNER_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// Replica index used to pin a request to an explicit address.
pub(crate) const PINNED_ADDRESS_REPLICA: i32 = -999_999_999;

/// A successful response and the address it came from.
#[derive(Debug, Clone)]
pub struct Response {
    pub packet: Packet,
    pub source_addr: String,
}

/// Outcome delivered to the caller.
pub type RequestResult = std::result::Result<Response, KvError>;

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    reasons: Vec<RetryReason>,
}

#[derive(Debug, Default, Clone)]
struct DispatchContext {
    bucket: String,
    last_dispatched_to: Option<String>,
    last_dispatched_from: Option<String>,
    last_connection_id: Option<String>,
    last_status: Option<Status>,
}

enum Completion {
    Once(oneshot::Sender<RequestResult>),
    Stream(mpsc::UnboundedSender<RequestResult>),
}

/// A request routed through the mux.
pub struct Request {
    id: u64,
    command: Command,
    key: Bytes,
    extras: Bytes,
    value: Bytes,
    cas: u64,
    datatype: u8,
    explicit_vbucket: bool,
    vbucket: AtomicU16,
    replica_idx: AtomicI32,
    server_group: Option<String>,
    pinned_address: Mutex<Option<String>>,
    idempotent: bool,
    persistent: bool,
    deadline: Option<Instant>,
    retry_strategy: Arc<dyn RetryStrategy>,

    sequence: AtomicU64,
    opaque: AtomicU32,
    owner: AtomicU64,
    completed: AtomicBool,
    dispatched: AtomicBool,
    written: AtomicBool,
    done: CancellationToken,

    retry: Mutex<RetryState>,
    context: Mutex<DispatchContext>,
    completion: Mutex<Option<Completion>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("vbucket", &self.vbucket())
            .field("replica_idx", &self.replica_idx())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Request {
    /// Start building a request for `command`.
    pub fn builder(command: Command) -> RequestBuilder {
        RequestBuilder::new(command)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket.load(Ordering::Acquire)
    }

    pub(crate) fn has_explicit_vbucket(&self) -> bool {
        self.explicit_vbucket
    }

    pub(crate) fn set_vbucket(&self, vbucket: u16) {
        self.vbucket.store(vbucket, Ordering::Release);
    }

    /// Replica index. Negative values pin the request to node `-idx - 1`.
    pub fn replica_idx(&self) -> i32 {
        self.replica_idx.load(Ordering::Acquire)
    }

    pub(crate) fn set_replica_idx(&self, idx: i32) {
        self.replica_idx.store(idx, Ordering::Release);
    }

    pub fn server_group(&self) -> Option<&str> {
        self.server_group.as_deref()
    }

    /// Address the request is pinned to by a direct dispatch.
    pub fn pinned_address(&self) -> Option<String> {
        self.pinned_address.lock().clone()
    }

    pub(crate) fn pin_to_address(&self, address: &str) {
        *self.pinned_address.lock() = Some(address.to_string());
        self.set_replica_idx(PINNED_ADDRESS_REPLICA);
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn retry_strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.retry_strategy
    }

    /// Order in which the request was first dispatched.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn opaque(&self) -> u32 {
        self.opaque.load(Ordering::Acquire)
    }

    pub(crate) fn set_opaque(&self, opaque: u32) {
        self.opaque.store(opaque, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether the request reached the wire at least once.
    pub fn was_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    pub(crate) fn mark_written(&self) {
        self.written.store(true, Ordering::Release);
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry.lock().attempts
    }

    pub fn retry_reasons(&self) -> Vec<RetryReason> {
        self.retry.lock().reasons.clone()
    }

    /// Record a retry for `reason`.
    pub fn record_retry(&self, reason: RetryReason) {
        let mut retry = self.retry.lock();
        retry.attempts += 1;
        retry.reasons.push(reason);
    }

    /// Address of the last connection that wrote this request.
    pub fn last_dispatched_to(&self) -> Option<String> {
        self.context.lock().last_dispatched_to.clone()
    }

    pub(crate) fn set_connection_info(&self, remote: &str, local: &str, conn_id: &str) {
        let mut ctx = self.context.lock();
        ctx.last_dispatched_to = Some(remote.to_string());
        ctx.last_dispatched_from = Some(local.to_string());
        ctx.last_connection_id = Some(conn_id.to_string());
    }

    pub(crate) fn set_last_status(&self, status: Status) {
        self.context.lock().last_status = Some(status);
    }

    /// Record first dispatch: assigns the ordering sequence and arms the
    /// deadline timer. Later calls are no-ops.
    pub(crate) fn mark_dispatched(self: &Arc<Self>, bucket: &str, sequence: u64) {
        if self.dispatched.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sequence.store(sequence, Ordering::Release);
        self.context.lock().bucket = bucket.to_string();

        if let Some(deadline) = self.deadline {
            let weak: Weak<Request> = Arc::downgrade(self);
            let done = self.done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        if let Some(req) = weak.upgrade() {
                            let ambiguous = req.was_written();
                            if req.try_complete(Err(Error::Timeout { ambiguous })) {
                                debug!(id = req.id, ambiguous, "request timed out");
                            }
                        }
                    }
                }
            });
        }
    }

    /// Claim ownership for `token`. Fails if another holder owns the request
    /// or if it has already completed.
    pub(crate) fn try_claim(&self, token: u64) -> bool {
        if self
            .owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.is_completed() {
            let _ = self
                .owner
                .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire);
            return false;
        }
        true
    }

    /// Release ownership held by `token`. Returns false if `token` was not
    /// the owner.
    pub(crate) fn release(&self, token: u64) -> bool {
        self.owner
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Build the wire packet for this dispatch.
    pub(crate) fn to_packet(&self, opaque: u32) -> Packet {
        Packet {
            command: self.command,
            datatype: self.datatype,
            vbucket: self.vbucket(),
            opaque,
            cas: self.cas,
            key: self.key.clone(),
            extras: self.extras.clone(),
            value: self.value.clone(),
            ..Packet::request(self.command)
        }
    }

    /// Deliver an intermediate success to a persistent request.
    pub(crate) fn deliver(&self, resp: Response) -> bool {
        if self.is_completed() {
            return false;
        }
        match self.completion.lock().as_ref() {
            Some(Completion::Stream(tx)) => tx.send(Ok(resp)).is_ok(),
            _ => false,
        }
    }

    /// Complete the request. Returns false if it was already completed.
    pub fn try_complete(&self, result: Result<Response, Error>) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.done.cancel();

        let result = result.map_err(|err| self.annotate(err));
        match self.completion.lock().take() {
            Some(Completion::Once(tx)) => {
                let _ = tx.send(result);
            }
            Some(Completion::Stream(tx)) => {
                let _ = tx.send(result);
            }
            None => {}
        }
        true
    }

    /// Cancel the request with `err`. Idempotent.
    pub fn cancel(&self, err: Error) -> bool {
        self.try_complete(Err(err))
    }

    fn annotate(&self, source: Error) -> KvError {
        let ctx = self.context.lock().clone();
        let retry = self.retry.lock();
        KvError {
            status: source.status().or(ctx.last_status),
            source,
            key: String::from_utf8_lossy(&self.key).into_owned(),
            bucket: ctx.bucket,
            opaque: self.opaque(),
            retry_attempts: retry.attempts,
            retry_reasons: retry.reasons.clone(),
            last_dispatched_to: ctx.last_dispatched_to,
            last_dispatched_from: ctx.last_dispatched_from,
            last_connection_id: ctx.last_connection_id,
        }
    }
}

/// Builder for [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    command: Command,
    key: Bytes,
    extras: Bytes,
    value: Bytes,
    cas: u64,
    datatype: u8,
    vbucket: Option<u16>,
    replica_idx: i32,
    server_group: Option<String>,
    idempotent: Option<bool>,
    deadline: Option<Instant>,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
}

impl RequestBuilder {
    fn new(command: Command) -> Self {
        Self {
            command,
            key: Bytes::new(),
            extras: Bytes::new(),
            value: Bytes::new(),
            cas: 0,
            datatype: 0,
            vbucket: None,
            replica_idx: 0,
            server_group: None,
            idempotent: None,
            deadline: None,
            retry_strategy: None,
        }
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    /// Route to an explicit vbucket instead of hashing the key.
    pub fn vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = Some(vbucket);
        self
    }

    /// Target replica `idx` (0 is the active copy).
    pub fn replica_index(mut self, idx: i32) -> Self {
        self.replica_idx = idx;
        self
    }

    /// Pin to the node at `node_idx` of the current topology.
    pub fn pinned_node(mut self, node_idx: usize) -> Self {
        self.replica_idx = -(node_idx as i32) - 1;
        self
    }

    pub fn server_group(mut self, group: impl Into<String>) -> Self {
        self.server_group = Some(group.into());
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    pub fn retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    fn into_request(self, persistent: bool, completion: Completion) -> Arc<Request> {
        let idempotent = self.idempotent.unwrap_or(matches!(
            self.command,
            Command::Get | Command::GetReplica | Command::Noop | Command::GetClusterConfig
        ));
        Arc::new(Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            command: self.command,
            key: self.key,
            extras: self.extras,
            value: self.value,
            cas: self.cas,
            datatype: self.datatype,
            explicit_vbucket: self.vbucket.is_some(),
            vbucket: AtomicU16::new(self.vbucket.unwrap_or(0)),
            replica_idx: AtomicI32::new(self.replica_idx),
            server_group: self.server_group,
            pinned_address: Mutex::new(None),
            idempotent,
            persistent,
            deadline: self.deadline,
            retry_strategy: self.retry_strategy.unwrap_or_else(default_retry_strategy),
            sequence: AtomicU64::new(0),
            opaque: AtomicU32::new(0),
            owner: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            dispatched: AtomicBool::new(false),
            written: AtomicBool::new(false),
            done: CancellationToken::new(),
            retry: Mutex::new(RetryState::default()),
            context: Mutex::new(DispatchContext::default()),
            completion: Mutex::new(Some(completion)),
        })
    }

    /// Build a request that completes once.
    pub fn build(self) -> (Arc<Request>, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let req = self.into_request(false, Completion::Once(tx));
        (req.clone(), PendingResponse { req, rx })
    }

    /// Build a persistent request delivering every success response until
    /// its first error or cancellation.
    pub fn build_streaming(self) -> (Arc<Request>, ResponseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let req = self.into_request(true, Completion::Stream(tx));
        (req.clone(), ResponseStream { req, rx })
    }
}

/// Future resolving to a request's single outcome.
#[derive(Debug)]
pub struct PendingResponse {
    req: Arc<Request>,
    rx: oneshot::Receiver<RequestResult>,
}

impl PendingResponse {
    pub fn request(&self) -> &Arc<Request> {
        &self.req
    }

    /// Cancel the request. The future then resolves to the cancellation.
    pub fn cancel(&self) -> bool {
        self.req.cancel(Error::Cancelled)
    }
}

impl Future for PendingResponse {
    type Output = RequestResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(self
                .req
                .annotate(Error::Internal("completion dropped".to_string())))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Receiver for a persistent request's responses.
#[derive(Debug)]
pub struct ResponseStream {
    req: Arc<Request>,
    rx: mpsc::UnboundedReceiver<RequestResult>,
}

impl ResponseStream {
    pub fn request(&self) -> &Arc<Request> {
        &self.req
    }

    /// Next response; `None` once the request has completed.
    pub async fn next(&mut self) -> Option<RequestResult> {
        self.rx.recv().await
    }

    pub fn cancel(&self) -> bool {
        self.req.cancel(Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> Response {
        Response {
            packet: Packet::default(),
            source_addr: "a:11210".to_string(),
        }
    }

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let (req, pending) = Request::builder(Command::Get).key("foo").build();
        assert!(req.try_complete(Ok(response())));
        assert!(!req.try_complete(Err(Error::Cancelled)));
        assert!(!req.cancel(Error::Shutdown));

        let resp = pending.await.unwrap();
        assert_eq!(resp.source_addr, "a:11210");
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (req, pending) = Request::builder(Command::Get).key("foo").build();
        assert!(pending.cancel());
        assert!(!pending.cancel());
        assert!(!req.try_complete(Ok(response())));

        let err = pending.await.unwrap_err();
        assert_eq!(err.source, Error::Cancelled);
        assert_eq!(err.key, "foo");
    }

    #[test]
    fn test_ownership_is_exclusive() {
        let (req, _pending) = Request::builder(Command::Get).build();
        let a = next_owner_token();
        let b = next_owner_token();

        assert!(req.try_claim(a));
        assert!(!req.try_claim(b));
        assert!(!req.release(b));
        assert!(req.release(a));
        assert!(req.try_claim(b));
    }

    #[test]
    fn test_completed_request_cannot_be_claimed() {
        let (req, _pending) = Request::builder(Command::Get).build();
        req.cancel(Error::Cancelled);
        assert!(!req.try_claim(next_owner_token()));
        assert!(!req.is_owned());
    }

    #[test]
    fn test_default_idempotency() {
        let (get, _p1) = Request::builder(Command::Get).build();
        let (set, _p2) = Request::builder(Command::Set).build();
        let (forced, _p3) = Request::builder(Command::Set).idempotent(true).build();
        assert!(get.is_idempotent());
        assert!(!set.is_idempotent());
        assert!(forced.is_idempotent());
    }

    #[test]
    fn test_pinned_node_encoding() {
        let (req, _pending) = Request::builder(Command::Get).pinned_node(2).build();
        assert_eq!(req.replica_idx(), -3);
    }

    #[tokio::test]
    async fn test_error_carries_retry_history() {
        let (req, pending) = Request::builder(Command::Get).key("k").build();
        req.record_retry(RetryReason::KvLocked);
        req.record_retry(RetryReason::KvTemporaryFailure);
        req.set_connection_info("10.0.0.1:11210", "10.0.0.9:50000", "conn-1");
        req.try_complete(Err(Error::Status(Status::Locked)));

        let err = pending.await.unwrap_err();
        assert_eq!(err.retry_attempts, 2);
        assert_eq!(
            err.retry_reasons,
            vec![RetryReason::KvLocked, RetryReason::KvTemporaryFailure]
        );
        assert_eq!(err.status, Some(Status::Locked));
        assert_eq!(err.last_dispatched_to.as_deref(), Some("10.0.0.1:11210"));
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let (req, pending) = Request::builder(Command::Get)
            .key("k")
            .timeout(Duration::from_millis(20))
            .build();
        req.mark_dispatched("default", 1);

        let err = pending.await.unwrap_err();
        assert_eq!(err.source, Error::Timeout { ambiguous: false });
        assert_eq!(err.bucket, "default");
    }

    #[tokio::test]
    async fn test_streaming_delivers_until_error() {
        let (req, mut stream) = Request::builder(Command::DcpStreamReq).build_streaming();
        assert!(req.is_persistent());
        assert!(req.deliver(response()));
        assert!(req.deliver(response()));
        req.try_complete(Err(Error::Cancelled));
        assert!(!req.deliver(response()));

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
