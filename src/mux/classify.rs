//! Classification of failed requests into retry reasons.

use super::kvmux::KvMux;
use crate::error::{Error, NetworkError, QueueError};
use crate::memd::{Command, Disposition, Packet, ResponseHandler, Status};
use crate::pipeline::{Request, Response};
use crate::retry::RetryReason;
use crate::topology::BucketConfig;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// The handler connections report to. Holds the mux weakly so connections
/// never keep it alive.
pub(crate) struct MuxHandler {
    mux: Weak<KvMux>,
}

impl MuxHandler {
    pub(crate) fn new(mux: Weak<KvMux>) -> Self {
        Self { mux }
    }
}

impl ResponseHandler for MuxHandler {
    fn handle_error(&self, resp: Option<&Response>, req: &Arc<Request>, err: Error) -> Disposition {
        match self.mux.upgrade() {
            Some(mux) => mux.handle_error(resp, req, err),
            None => Disposition::Fail(Error::Shutdown),
        }
    }

    fn handle_server_request(&self, packet: Packet, source_addr: &str) {
        if let Some(mux) = self.mux.upgrade() {
            mux.handle_server_request(packet, source_addr);
        }
    }
}

fn status_retry_reason(status: Status) -> Option<RetryReason> {
    match status {
        Status::Locked => Some(RetryReason::KvLocked),
        Status::TmpFail => Some(RetryReason::KvTemporaryFailure),
        Status::SyncWriteInProgress => Some(RetryReason::KvSyncWriteInProgress),
        Status::SyncWriteReCommitInProgress => Some(RetryReason::KvSyncWriteRecommitInProgress),
        Status::Busy => Some(RetryReason::KvErrMapRetry),
        _ => None,
    }
}

impl KvMux {
    /// Decide what happens to a request that failed with `err`.
    pub(crate) fn handle_error(
        &self,
        resp: Option<&Response>,
        req: &Arc<Request>,
        err: Error,
    ) -> Disposition {
        if req.is_completed() {
            return Disposition::Fail(err);
        }

        let reason = match &err {
            Error::Network(NetworkError::ConnectionClosed) => {
                if req.command() == Command::GetClusterConfig {
                    return Disposition::Fail(err);
                }
                if req.is_idempotent() || !req.was_written() {
                    RetryReason::SocketNotAvailable
                } else {
                    RetryReason::SocketCloseInFlight
                }
            }
            Error::Network(NetworkError::ClientClosed) => RetryReason::SocketNotAvailable,
            Error::Network(NetworkError::WriteFailed(_)) => RetryReason::MemdWriteFailure,
            Error::Overload | Error::Queue(QueueError::Full) => RetryReason::PipelineOverloaded,
            Error::Status(Status::NotMyVbucket) => {
                return self.handle_not_my_vbucket(resp, req, err);
            }
            Error::Status(Status::ConfigOnly) => {
                self.spawn_refresh();
                RetryReason::ServiceResponseCodeIndicated
            }
            Error::Status(status) => match status_retry_reason(*status) {
                Some(reason) => reason,
                None => return Disposition::Fail(err),
            },
            _ => return Disposition::Fail(err),
        };

        self.retry_or_fail(req, reason, err)
    }

    fn retry_or_fail(&self, req: &Arc<Request>, reason: RetryReason, err: Error) -> Disposition {
        match self.orchestrator.should_retry(req, reason) {
            Some(at) => {
                trace!(id = req.id(), %reason, "scheduling retry");
                self.wait_and_retry(req.clone(), at);
                Disposition::Retrying
            }
            None => Disposition::Fail(err),
        }
    }

    /// Requeue `req` at `at`, unless it completes or the mux shuts down
    /// first.
    fn wait_and_retry(&self, req: Arc<Request>, at: Instant) {
        let mux = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(at.into()) => {}
                _ = shutdown.cancelled() => {
                    req.try_complete(Err(Error::Shutdown));
                    return;
                }
            }
            if req.is_completed() {
                return;
            }
            match mux.upgrade() {
                Some(mux) => mux.requeue_direct(req),
                None => {
                    req.try_complete(Err(Error::Shutdown));
                }
            }
        });
    }

    /// Apply the config carried by the response, then send the request
    /// straight to its new owner if routing changed. Otherwise retry after
    /// a backoff.
    fn handle_not_my_vbucket(
        &self,
        resp: Option<&Response>,
        req: &Arc<Request>,
        err: Error,
    ) -> Disposition {
        if req.command() == Command::RangeScanContinue {
            return Disposition::Fail(err);
        }

        let failed_address = resp
            .map(|r| r.source_addr.clone())
            .or_else(|| req.last_dispatched_to());
        if let Some(resp) = resp {
            if !resp.packet.value.is_empty() {
                match BucketConfig::parse_from_address(&resp.packet.value, &resp.source_addr) {
                    Ok(config) => {
                        self.topology.propose_topology(&config);
                    }
                    Err(e) => {
                        warn!(address = %resp.source_addr, error = %e, "failed to parse config from not-my-vbucket response");
                    }
                }
            }
        }

        if let Some(state) = self.state() {
            let old_vbucket = req.vbucket();
            if let Ok(pipeline) = self.route_request(&state, req) {
                let moved = failed_address.as_deref() != Some(pipeline.address())
                    || req.vbucket() != old_vbucket;
                if moved {
                    debug!(
                        id = req.id(),
                        from = ?failed_address,
                        to = %pipeline.address(),
                        "redirecting request after not-my-vbucket"
                    );
                    self.requeue_direct(req.clone());
                    return Disposition::Retrying;
                }
            }
        }

        self.retry_or_fail(req, RetryReason::KvNotMyVbucket, err)
    }

    fn spawn_refresh(&self) {
        let topology = self.topology.clone();
        tokio::spawn(async move {
            topology.refresh().await;
        });
    }

    pub(crate) fn handle_server_request(&self, packet: Packet, source_addr: &str) {
        match packet.cluster_map_version() {
            Some((epoch, rev)) => {
                debug!(address = %source_addr, epoch, rev, "cluster map change notification");
                self.topology.on_change_notification(epoch, rev);
            }
            None => debug!(address = %source_addr, "malformed cluster map change notification"),
        }
    }
}
