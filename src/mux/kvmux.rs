//! The request multiplexer: routes requests to node pipelines and swaps
//! routing state when the topology changes.

use super::classify::MuxHandler;
use super::state::{ConnectionSettings, MuxDialer, PipelineSnapshot, RoutingState};
use crate::config::PipelineConfig;
use crate::error::{Error, QueueError, Result, RoutingError};
use crate::memd::{Command, ConnectionProvider, Disposition, KvClient, ResponseHandler};
use crate::pipeline::{NodePipeline, PipelineContext, Request, PINNED_ADDRESS_REPLICA};
use crate::retry::RetryOrchestrator;
use crate::topology::{RouteConfig, TopologyManager, TopologyWatcher};
use crate::types::{AuthMechanism, AuthProvider, BucketCapability, BucketType, CapabilityStatus, TlsSettings};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

fn pipeline_context(
    provider: &Arc<dyn ConnectionProvider>,
    settings: &Arc<ConnectionSettings>,
    handler: &Arc<dyn ResponseHandler>,
    config: &PipelineConfig,
) -> Arc<PipelineContext> {
    Arc::new(PipelineContext {
        dialer: Arc::new(MuxDialer::new(
            provider.clone(),
            settings.clone(),
            handler.clone(),
        )),
        handler: handler.clone(),
        config: config.clone(),
    })
}

/// Routes requests to node pipelines.
///
/// Readers load the routing state with a single atomic pointer load.
/// Writers (topology changes, forced reconnects) serialize on
/// `update_lock` and replace the state by compare-and-swap, then reconcile
/// pipelines and requeue whatever the old state still held.
pub struct KvMux {
    bucket_name: String,
    state: ArcSwapOption<RoutingState>,
    update_lock: Mutex<()>,

    pub(crate) topology: Arc<TopologyManager>,
    pub(crate) orchestrator: Arc<dyn RetryOrchestrator>,
    provider: Arc<dyn ConnectionProvider>,
    pipeline_config: PipelineConfig,
    handler: Arc<dyn ResponseHandler>,
    pub(crate) weak_self: Weak<KvMux>,

    closing_clients: TaskTracker,
    pub(crate) shutdown: CancellationToken,
    config_seen: watch::Sender<bool>,
    sequence: AtomicU64,
}

impl KvMux {
    /// Create a mux routing with `topology`'s current config. Pipelines are
    /// built but not started; see [`start`](Self::start).
    pub fn new(
        topology: Arc<TopologyManager>,
        provider: Arc<dyn ConnectionProvider>,
        settings: ConnectionSettings,
        pipeline_config: PipelineConfig,
        orchestrator: Arc<dyn RetryOrchestrator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<KvMux>| {
            let handler: Arc<dyn ResponseHandler> = Arc::new(MuxHandler::new(weak.clone()));
            let settings = Arc::new(settings);
            let context = pipeline_context(&provider, &settings, &handler, &pipeline_config);
            let initial = RoutingState::new(topology.current(), settings, context);
            let (config_seen, _) = watch::channel(topology.has_seen_config());

            Self {
                bucket_name: topology.bucket_name().to_string(),
                state: ArcSwapOption::from_pointee(initial),
                update_lock: Mutex::new(()),
                topology,
                orchestrator,
                provider,
                pipeline_config,
                handler,
                weak_self: weak.clone(),
                closing_clients: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                config_seen,
                sequence: AtomicU64::new(1),
            }
        })
    }

    /// Start workers for the initial pipelines.
    pub fn start(&self) {
        if let Some(state) = self.state.load_full() {
            for pipeline in &state.pipelines {
                pipeline.start_workers();
            }
        }
    }

    /// A watcher forwarding applied topologies to this mux.
    pub fn watcher(self: &Arc<Self>) -> Arc<dyn TopologyWatcher> {
        let weak = Arc::downgrade(self);
        Arc::new(move |config: Arc<RouteConfig>| {
            if let Some(mux) = weak.upgrade() {
                mux.on_new_topology(config);
            }
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub(crate) fn state(&self) -> Option<Arc<RoutingState>> {
        self.state.load_full()
    }

    pub fn is_closed(&self) -> bool {
        self.state.load().is_none()
    }

    /// Route `req` and queue it on its pipeline.
    ///
    /// Errors are returned to the caller and the request is left
    /// uncompleted. A full queue is classified as overload first, so the
    /// request may be retried instead.
    pub fn dispatch(&self, req: Arc<Request>) -> Result<()> {
        req.mark_dispatched(
            &self.bucket_name,
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );

        loop {
            let state = self.state.load_full().ok_or(Error::Shutdown)?;
            let pipeline = self.route_request(&state, &req)?;

            match pipeline.send_request(req.clone()) {
                Ok(()) => return Ok(()),
                Err(QueueError::Closed) => {
                    debug!(address = %pipeline.address(), "pipeline closed during dispatch, rerouting");
                    continue;
                }
                Err(QueueError::Full) => {
                    return match self.handle_error(None, &req, Error::Overload) {
                        Disposition::Retrying => Ok(()),
                        Disposition::Fail(err) => Err(err),
                    };
                }
                Err(QueueError::Cancelled) => return Err(Error::Cancelled),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Dispatch `req` to the pipeline for `address`, bypassing key routing.
    /// The request must target replica 0.
    pub fn dispatch_to_address(&self, req: Arc<Request>, address: &str) -> Result<()> {
        if req.replica_idx() != 0 {
            return Err(RoutingError::InvalidArgument(
                "direct dispatch requires replica index 0".to_string(),
            )
            .into());
        }
        req.pin_to_address(address);
        self.dispatch(req)
    }

    /// Route a request again, ignoring queue limits. Failures complete the
    /// request.
    pub fn requeue(&self, req: Arc<Request>) {
        self.requeue_direct(req);
    }

    pub(crate) fn requeue_direct(&self, req: Arc<Request>) {
        loop {
            let Some(state) = self.state.load_full() else {
                req.try_complete(Err(Error::Shutdown));
                return;
            };
            let pipeline = match self.route_request(&state, &req) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    req.try_complete(Err(err));
                    return;
                }
            };

            match pipeline.requeue_request(req.clone()) {
                Ok(()) | Err(QueueError::Cancelled) => return,
                Err(QueueError::Closed) => continue,
                Err(QueueError::AlreadyQueued) => {
                    error!(id = req.id(), "requeued a request that is still owned");
                    return;
                }
                Err(QueueError::Full) => {
                    req.try_complete(Err(Error::Overload));
                    return;
                }
            }
        }
    }

    /// Resolve the pipeline for `req` against `state`.
    pub(crate) fn route_request(
        &self,
        state: &RoutingState,
        req: &Request,
    ) -> Result<Arc<NodePipeline>> {
        let replica_idx = req.replica_idx();
        let pipeline = if replica_idx == PINNED_ADDRESS_REPLICA {
            let address = req.pinned_address().unwrap_or_default();
            state
                .pipeline_by_address(&address)
                .cloned()
                .ok_or(RoutingError::InvalidServer(address))?
        } else if state.config.is_bootstrap() {
            return Ok(state.dead_pipe.clone());
        } else if replica_idx < 0 {
            let idx = (-(replica_idx as i64) - 1) as usize;
            state
                .pipeline(idx)
                .cloned()
                .ok_or_else(|| RoutingError::InvalidServer(format!("node index {}", idx)))?
        } else {
            match self.route_by_key(state, req, replica_idx as usize)? {
                Some(pipeline) => pipeline,
                None => return Ok(state.dead_pipe.clone()),
            }
        };

        if let Some(group) = req.server_group() {
            if pipeline.server_group() != group {
                return Err(RoutingError::ServerGroupMismatch {
                    wanted: group.to_string(),
                    actual: pipeline.server_group().to_string(),
                    address: pipeline.address().to_string(),
                }
                .into());
            }
        }
        Ok(pipeline)
    }

    /// `Ok(None)` means the owning slot is unassigned and the request should
    /// wait in the dead pipeline for the next topology.
    fn route_by_key(
        &self,
        state: &RoutingState,
        req: &Request,
        replica_idx: usize,
    ) -> Result<Option<Arc<NodePipeline>>> {
        let config = &state.config;
        let node = match config.bucket_type {
            BucketType::Partitioned => {
                let map = config
                    .vbucket_map
                    .as_ref()
                    .ok_or(RoutingError::NoRoutingTable)?;
                if !req.has_explicit_vbucket() {
                    req.set_vbucket(map.vbucket_by_key(req.key()));
                }
                map.node_by_vbucket(req.vbucket(), replica_idx)?
            }
            BucketType::RingHashed => {
                if replica_idx > 0 {
                    return Err(RoutingError::InvalidReplica {
                        index: replica_idx as i32,
                        num_replicas: 0,
                    }
                    .into());
                }
                let ring = config
                    .ketama_ring
                    .as_ref()
                    .ok_or(RoutingError::NoRoutingTable)?;
                Some(ring.node_by_key(req.key())?)
            }
            BucketType::None => return Err(RoutingError::GcccpInUse.into()),
            BucketType::Invalid => return Err(RoutingError::NoRoutingTable.into()),
        };
        Ok(node.and_then(|idx| state.pipeline(idx).cloned()))
    }

    /// Replace `current` with `new` if it is still the live state.
    fn swap_state(
        &self,
        current: &Option<Arc<RoutingState>>,
        new: Option<Arc<RoutingState>>,
    ) -> bool {
        let previous = self.state.compare_and_swap(current, new);
        match (&*previous, current) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Apply a topology accepted by the manager.
    pub fn on_new_topology(&self, config: Arc<RouteConfig>) {
        let _update = self.update_lock.lock();
        loop {
            let current = self.state.load_full();
            let Some(old) = current.clone() else {
                debug!(rev_id = config.rev_id, "mux closed, ignoring topology");
                return;
            };

            let new = Arc::new(RoutingState::new(
                config.clone(),
                old.settings.clone(),
                old.context.clone(),
            ));
            if !self.swap_state(&current, Some(new.clone())) {
                warn!(rev_id = config.rev_id, "routing state changed during update, retrying");
                continue;
            }

            info!(
                old_rev = old.rev_id(),
                new_rev = config.rev_id,
                pipelines = new.pipelines.len(),
                "switching routing state"
            );
            self.reconcile(&old, &new, true);
            if !config.is_bootstrap() {
                self.config_seen.send_replace(true);
            }
            return;
        }
    }

    /// Rebuild every connection with new credentials, keeping the topology.
    pub fn force_reconnect(
        &self,
        tls: Option<Arc<TlsSettings>>,
        auth: Arc<dyn AuthProvider>,
        mechanisms: Vec<AuthMechanism>,
    ) {
        let _update = self.update_lock.lock();
        loop {
            let current = self.state.load_full();
            let Some(old) = current.clone() else {
                debug!("mux closed, ignoring reconnect");
                return;
            };

            let settings = Arc::new(ConnectionSettings {
                use_tls: tls.is_some(),
                no_tls_seed_node: old.settings.no_tls_seed_node,
                tls: tls.clone(),
                auth: auth.clone(),
                mechanisms: mechanisms.clone(),
            });
            let context = pipeline_context(
                &self.provider,
                &settings,
                &self.handler,
                &self.pipeline_config,
            );
            let new = Arc::new(RoutingState::new(old.config.clone(), settings, context));
            if !self.swap_state(&current, Some(new.clone())) {
                warn!("routing state changed during reconnect, retrying");
                continue;
            }

            info!(rev_id = old.rev_id(), "forcing reconnect of all pipelines");
            self.reconcile(&old, &new, false);
            return;
        }
    }

    /// Move work from `old` to `new`: surviving addresses are taken over
    /// when `takeover` is set, the rest of `old` is closed, and everything
    /// still queued in `old` is routed again.
    fn reconcile(&self, old: &RoutingState, new: &RoutingState, takeover: bool) {
        for pipeline in &new.pipelines {
            if takeover {
                if let Some(old_pipeline) = old.pipeline_by_address(pipeline.address()) {
                    pipeline.takeover(old_pipeline);
                }
            }
            pipeline.start_workers();
        }

        let close_err = if takeover {
            None
        } else {
            Some(Error::ForcedReconnect)
        };
        for old_pipeline in &old.pipelines {
            if takeover && new.pipeline_by_address(old_pipeline.address()).is_some() {
                continue;
            }
            debug!(address = %old_pipeline.address(), "closing pipeline");
            self.close_clients(old_pipeline.graceful_close(), close_err.clone());
        }

        old.dead_pipe.queue().close();
        self.requeue_requests(old);
    }

    fn requeue_requests(&self, old: &RoutingState) {
        let mut requests = Vec::new();
        for pipeline in &old.pipelines {
            pipeline.drain(|req| requests.push(req));
        }
        old.dead_pipe.drain(|req| requests.push(req));

        if requests.is_empty() {
            return;
        }
        requests.sort_by_key(|req| (req.sequence(), req.id()));
        debug!(count = requests.len(), "requeueing requests from previous routing state");

        for req in requests {
            if req.command() == Command::GetClusterConfig {
                req.cancel(Error::Cancelled);
                continue;
            }
            self.requeue_direct(req);
        }
    }

    /// Close `clients` once their in-flight requests finish, or at shutdown.
    fn close_clients(&self, clients: Vec<Arc<KvClient>>, err: Option<Error>) {
        for client in clients {
            client.graceful_close(err.clone());
            let shutdown = self.shutdown.clone();
            self.closing_clients.spawn(async move {
                tokio::select! {
                    _ = client.closed() => {}
                    _ = shutdown.cancelled() => client.close().await,
                }
            });
        }
    }

    /// Shut down: fail queued requests, close every connection and wait for
    /// them. A second call returns `Error::Shutdown`.
    pub async fn close(&self) -> Result<()> {
        let old = {
            let _update = self.update_lock.lock();
            self.state.swap(None)
        };
        let Some(old) = old else {
            return Err(Error::Shutdown);
        };
        info!(rev_id = old.rev_id(), "closing mux");

        let mut clients = Vec::new();
        for pipeline in &old.pipelines {
            clients.extend(pipeline.graceful_close());
        }
        old.dead_pipe.queue().close();

        let mut requests = Vec::new();
        for pipeline in &old.pipelines {
            pipeline.drain(|req| requests.push(req));
        }
        old.dead_pipe.drain(|req| requests.push(req));
        for req in requests {
            req.try_complete(Err(Error::Shutdown));
        }

        self.close_clients(clients, Some(Error::Shutdown));
        self.shutdown.cancel();
        self.closing_clients.close();
        self.closing_clients.wait().await;
        debug!("mux closed");
        Ok(())
    }

    /// Wait until a real topology has been applied.
    pub async fn wait_for_config(&self, deadline: Instant) -> Result<PipelineSnapshot> {
        let mut seen = self.config_seen.subscribe();
        let wait = async {
            tokio::select! {
                result = seen.wait_for(|seen| *seen) => result.is_ok(),
                _ = self.shutdown.cancelled() => false,
            }
        };
        match tokio::time::timeout_at(deadline.into(), wait).await {
            Ok(true) => self.pipeline_snapshot(),
            Ok(false) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout { ambiguous: false }),
        }
    }

    pub fn config_snapshot(&self) -> Result<Arc<RouteConfig>> {
        self.state
            .load_full()
            .map(|state| state.config.clone())
            .ok_or(Error::Shutdown)
    }

    pub fn pipeline_snapshot(&self) -> Result<PipelineSnapshot> {
        self.state
            .load_full()
            .map(PipelineSnapshot::new)
            .ok_or(Error::Shutdown)
    }

    pub fn config_rev(&self) -> Result<i64> {
        Ok(self.config_snapshot()?.rev_id)
    }

    pub fn config_uuid(&self) -> Result<String> {
        Ok(self.config_snapshot()?.uuid.clone())
    }

    pub fn bucket_type(&self) -> Result<BucketType> {
        Ok(self.config_snapshot()?.bucket_type)
    }

    pub fn num_pipelines(&self) -> Result<usize> {
        Ok(self.state.load_full().ok_or(Error::Shutdown)?.pipelines.len())
    }

    pub fn num_replicas(&self) -> Result<usize> {
        let config = self.config_snapshot()?;
        config
            .vbucket_map
            .as_ref()
            .map(|map| map.num_replicas())
            .ok_or_else(|| RoutingError::NoRoutingTable.into())
    }

    pub fn key_to_vbucket(&self, key: &[u8]) -> Result<u16> {
        let config = self.config_snapshot()?;
        config
            .vbucket_map
            .as_ref()
            .map(|map| map.vbucket_by_key(key))
            .ok_or_else(|| RoutingError::NoRoutingTable.into())
    }

    /// Whether the cluster serves cluster-level configs.
    pub fn supports_gcccp(&self) -> Result<bool> {
        Ok(!self.config_snapshot()?.cluster_capabilities_ver.is_empty())
    }

    pub fn bucket_capability_status(&self, cap: BucketCapability) -> Result<CapabilityStatus> {
        Ok(self.config_snapshot()?.capability_status(cap))
    }
}
