//! In-protocol config polling over the KV connections.

use super::{LoopControl, TopologyPoller};
use crate::error::{Error, Result};
use crate::memd::Command;
use crate::mux::{KvMux, PipelineSnapshot};
use crate::pipeline::Request;
use crate::retry::FailFastRetryStrategy;
use crate::topology::BucketConfig;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type SharedFetch = Shared<BoxFuture<'static, Result<()>>>;

/// Polls one node per attempt with `GetClusterConfig`, rotating through
/// the pipelines of the current routing state.
pub struct CccpPoller {
    mux: Arc<KvMux>,
    poll_period: Duration,
    max_wait: Duration,
    next_node: AtomicUsize,
    control: LoopControl,
    in_flight: Mutex<Option<(u64, SharedFetch)>>,
    fetch_seq: AtomicU64,
}

impl CccpPoller {
    pub fn new(mux: Arc<KvMux>, poll_period: Duration, max_wait: Duration) -> Self {
        Self {
            mux,
            poll_period,
            max_wait,
            next_node: AtomicUsize::new(0),
            control: LoopControl::new(),
            in_flight: Mutex::new(None),
            fetch_seq: AtomicU64::new(0),
        }
    }

    /// Fetch and apply a config now. Concurrent callers share one fetch.
    pub async fn refresh_now(self: &Arc<Self>) -> Result<()> {
        let fetch = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some((_, fetch)) => {
                    trace!("joining in-flight config fetch");
                    fetch.clone()
                }
                None => {
                    let id = self.fetch_seq.fetch_add(1, Ordering::Relaxed);
                    let poller = self.clone();
                    // Cleared by the fetch itself, not by its waiters.
                    let handle = tokio::spawn(async move {
                        let result = poller.fetch().await;
                        let mut slot = poller.in_flight.lock();
                        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                            *slot = None;
                        }
                        result
                    });
                    let fetch = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(Error::Internal(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, fetch.clone()));
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Try each pipeline in turn, starting after the last one used, until
    /// one returns a config or a fallback condition is hit.
    async fn fetch(&self) -> Result<()> {
        let snapshot = self.mux.pipeline_snapshot()?;
        let num_nodes = snapshot.num_pipelines();
        if num_nodes == 0 {
            return Err(Error::NoCccpHosts);
        }

        let start = self.next_node.load(Ordering::Relaxed);
        let mut last_err = None;
        for pipeline in snapshot.iter_from(start) {
            self.next_node
                .store((self.next_node.load(Ordering::Relaxed) + 1) % num_nodes, Ordering::Relaxed);
            let address = pipeline.address().to_string();

            match self.get_cluster_config(&address, &snapshot).await {
                Ok(None) => {
                    trace!(address = %address, "no newer config");
                    return Ok(());
                }
                Ok(Some(data)) => match BucketConfig::parse_from_address(&data, &address) {
                    Ok(config) => {
                        if !self.control.is_paused() {
                            self.mux.topology().propose_topology(&config);
                        }
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "failed to parse cluster config");
                        last_err = Some(e.into());
                    }
                },
                Err(err) if err.is_polling_fallback() => return Err(err),
                Err(err) => {
                    debug!(address = %address, error = %err, "cluster config fetch failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoCccpHosts))
    }

    /// `Ok(None)` when the node has nothing newer than the known version.
    async fn get_cluster_config(
        &self,
        address: &str,
        snapshot: &PipelineSnapshot,
    ) -> Result<Option<Bytes>> {
        let mut builder = Request::builder(Command::GetClusterConfig)
            .retry_strategy(Arc::new(FailFastRetryStrategy))
            .timeout(self.max_wait);
        let config = snapshot.config();
        if !config.is_bootstrap() {
            let mut extras = BytesMut::with_capacity(16);
            extras.put_u64(config.rev_epoch as u64);
            extras.put_u64(config.rev_id as u64);
            builder = builder.extras(extras.freeze());
        }

        let (req, pending) = builder.build();
        self.mux.dispatch_to_address(req, address)?;
        let resp = pending.await.map_err(|e| e.source)?;
        if resp.packet.value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(resp.packet.value))
        }
    }
}

#[async_trait]
impl TopologyPoller for CccpPoller {
    async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(period = ?self.poll_period, "cccp poller started");

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("cccp poller stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            if self.control.is_paused() {
                continue;
            }

            match self.refresh_now().await {
                Ok(()) => {}
                Err(err) if err.is_polling_fallback() => {
                    warn!(error = %err, "cccp polling unavailable");
                    self.control.set_error(err.clone());
                    return Err(err);
                }
                Err(err) => {
                    debug!(error = %err, "cccp poll failed");
                    self.control.set_error(err);
                }
            }
        }
    }

    fn pause(&self, paused: bool) {
        self.control.pause(paused);
    }

    fn stop(&self) {
        self.control.stop();
    }

    fn stop_token(&self) -> CancellationToken {
        self.control.token()
    }

    fn reset(&self) {
        self.control.reset();
    }

    fn last_error(&self) -> Option<Error> {
        self.control.last_error()
    }
}
