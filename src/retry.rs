//! Retry reasons, strategies, and the orchestrator consulted by the mux.
//!
//! The mux never decides retry timing itself. For every recoverable
//! condition it names a [`RetryReason`] and asks a [`RetryOrchestrator`]
//! whether, and when, to requeue the request.

use crate::pipeline::Request;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Why a request is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    SocketNotAvailable,
    ServiceNotAvailable,
    NodeNotAvailable,
    KvNotMyVbucket,
    KvCollectionOutdated,
    KvErrMapRetry,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteRecommitInProgress,
    ServiceResponseCodeIndicated,
    SocketCloseInFlight,
    PipelineOverloaded,
    CircuitBreakerOpen,
    MemdWriteFailure,
    NoPipelineSnapshot,
}

impl RetryReason {
    /// Whether a non-idempotent request may be retried for this reason.
    pub fn allows_non_idempotent_retry(&self) -> bool {
        !matches!(self, RetryReason::SocketCloseInFlight)
    }

    /// Whether this reason is retried regardless of the request's strategy.
    pub fn always_retry(&self) -> bool {
        matches!(
            self,
            RetryReason::KvNotMyVbucket | RetryReason::KvCollectionOutdated
        )
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryReason::SocketNotAvailable => "SOCKET_NOT_AVAILABLE",
            RetryReason::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            RetryReason::NodeNotAvailable => "NODE_NOT_AVAILABLE",
            RetryReason::KvNotMyVbucket => "KV_NOT_MY_VBUCKET",
            RetryReason::KvCollectionOutdated => "KV_COLLECTION_OUTDATED",
            RetryReason::KvErrMapRetry => "KV_ERROR_MAP_RETRY_INDICATED",
            RetryReason::KvLocked => "KV_LOCKED",
            RetryReason::KvTemporaryFailure => "KV_TEMPORARY_FAILURE",
            RetryReason::KvSyncWriteInProgress => "KV_SYNC_WRITE_IN_PROGRESS",
            RetryReason::KvSyncWriteRecommitInProgress => "KV_SYNC_WRITE_RE_COMMIT_IN_PROGRESS",
            RetryReason::ServiceResponseCodeIndicated => "SERVICE_RESPONSE_CODE_INDICATED",
            RetryReason::SocketCloseInFlight => "SOCKET_CLOSED_WHILE_IN_FLIGHT",
            RetryReason::PipelineOverloaded => "PIPELINE_OVERLOADED",
            RetryReason::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            RetryReason::MemdWriteFailure => "MEMD_WRITE_FAILURE",
            RetryReason::NoPipelineSnapshot => "NO_PIPELINE_SNAPSHOT",
        };
        write!(f, "{}", s)
    }
}

/// Per-request retry policy.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Returns how long to wait before the next attempt, or `None` to stop.
    fn retry_after(&self, req: &Request, reason: RetryReason) -> Option<Duration>;
}

/// Retries with exponential backoff from 1ms up to 500ms.
#[derive(Debug, Clone)]
pub struct BestEffortRetryStrategy {
    min: Duration,
    max: Duration,
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1),
            max: Duration::from_millis(500),
        }
    }
}

impl BestEffortRetryStrategy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, req: &Request, _reason: RetryReason) -> Option<Duration> {
        let factor = 1u32
            .checked_shl(req.retry_attempts().min(16))
            .unwrap_or(u32::MAX);
        Some(self.min.saturating_mul(factor).min(self.max))
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _req: &Request, _reason: RetryReason) -> Option<Duration> {
        None
    }
}

/// Backoff used for reasons that always retry.
pub fn controlled_backoff(attempts: u32) -> Duration {
    match attempts {
        0 => Duration::from_millis(1),
        1 => Duration::from_millis(10),
        2 => Duration::from_millis(50),
        3 => Duration::from_millis(100),
        4 => Duration::from_millis(500),
        _ => Duration::from_millis(1000),
    }
}

/// Decides whether a request is retried and when.
pub trait RetryOrchestrator: Send + Sync {
    /// Returns the instant the request may be retried at, or `None` if it
    /// must fail. An accepted retry is recorded on the request.
    fn should_retry(&self, req: &Request, reason: RetryReason) -> Option<Instant>;
}

/// The default orchestrator.
///
/// Always-retry reasons use [`controlled_backoff`]. Otherwise non-idempotent
/// requests are refused unless the reason allows it, and the request's own
/// strategy picks the delay.
#[derive(Debug, Default, Clone)]
pub struct StandardRetryOrchestrator;

impl RetryOrchestrator for StandardRetryOrchestrator {
    fn should_retry(&self, req: &Request, reason: RetryReason) -> Option<Instant> {
        if reason.always_retry() {
            let delay = controlled_backoff(req.retry_attempts());
            trace!(%reason, ?delay, "retrying request (always retry)");
            req.record_retry(reason);
            return Some(Instant::now() + delay);
        }

        if !req.is_idempotent() && !reason.allows_non_idempotent_retry() {
            trace!(%reason, "not retrying non-idempotent request");
            return None;
        }

        let delay = req.retry_strategy().retry_after(req, reason)?;
        if delay.is_zero() {
            return None;
        }

        trace!(%reason, ?delay, "retrying request");
        req.record_retry(reason);
        Some(Instant::now() + delay)
    }
}

/// Returns the strategy used by requests that do not set one.
pub fn default_retry_strategy() -> Arc<dyn RetryStrategy> {
    Arc::new(BestEffortRetryStrategy::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memd::Command;

    #[test]
    fn test_controlled_backoff_steps() {
        let steps: Vec<u64> = (0..7).map(|a| controlled_backoff(a).as_millis() as u64).collect();
        assert_eq!(steps, vec![1, 10, 50, 100, 500, 1000, 1000]);
    }

    #[test]
    fn test_always_retry_ignores_strategy() {
        let (req, _pending) = Request::builder(Command::Set)
            .key("doc")
            .retry_strategy(Arc::new(FailFastRetryStrategy))
            .build();
        let orchestrator = StandardRetryOrchestrator;

        let at = orchestrator.should_retry(&req, RetryReason::KvNotMyVbucket);
        assert!(at.is_some());
        assert_eq!(req.retry_attempts(), 1);
        assert_eq!(req.retry_reasons(), vec![RetryReason::KvNotMyVbucket]);
    }

    #[test]
    fn test_fail_fast_refuses() {
        let (req, _pending) = Request::builder(Command::Get)
            .key("doc")
            .retry_strategy(Arc::new(FailFastRetryStrategy))
            .build();
        assert!(StandardRetryOrchestrator
            .should_retry(&req, RetryReason::KvLocked)
            .is_none());
        assert_eq!(req.retry_attempts(), 0);
    }

    #[test]
    fn test_non_idempotent_in_flight_close_not_retried() {
        let (req, _pending) = Request::builder(Command::Set).key("doc").build();
        assert!(!req.is_idempotent());
        assert!(StandardRetryOrchestrator
            .should_retry(&req, RetryReason::SocketCloseInFlight)
            .is_none());

        let (get, _pending) = Request::builder(Command::Get).key("doc").build();
        assert!(StandardRetryOrchestrator
            .should_retry(&get, RetryReason::SocketCloseInFlight)
            .is_some());
    }

    #[test]
    fn test_best_effort_backoff_grows() {
        let (req, _pending) = Request::builder(Command::Get).key("doc").build();
        let strategy = BestEffortRetryStrategy::default();
        let first = strategy.retry_after(&req, RetryReason::KvLocked).unwrap();
        for _ in 0..20 {
            req.record_retry(RetryReason::KvLocked);
        }
        let later = strategy.retry_after(&req, RetryReason::KvLocked).unwrap();
        assert_eq!(first, Duration::from_millis(1));
        assert_eq!(later, Duration::from_millis(500));
    }
}
