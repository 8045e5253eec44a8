//! Owns the applied topology, fences candidates and notifies watchers.

use super::bucket_config::BucketConfig;
use super::route_config::RouteConfig;
use crate::types::{BucketType, DEFAULT_NETWORK, EXTERNAL_NETWORK};
use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Receives every applied topology.
pub trait TopologyWatcher: Send + Sync {
    fn on_new_topology(&self, config: Arc<RouteConfig>);
}

impl<F> TopologyWatcher for F
where
    F: Fn(Arc<RouteConfig>) + Send + Sync,
{
    fn on_new_topology(&self, config: Arc<RouteConfig>) {
        self(config)
    }
}

/// Handle returned by [`TopologyManager::add_watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

/// Fetches configs on demand.
#[async_trait]
pub trait ConfigRefresher: Send + Sync {
    /// Fetch a config now. Concurrent calls share one fetch.
    async fn refresh(&self);

    /// The cluster announced that `(epoch, rev)` exists.
    fn on_change_notification(&self, epoch: i64, rev: i64);
}

struct ManagerState {
    current: Arc<RouteConfig>,
    seen_config: bool,
    network_type: Option<String>,
}

/// Applies topologies in revision order.
pub struct TopologyManager {
    bucket_name: String,
    network_override: Option<String>,
    /// Addresses the client bootstrapped through, used to pick a network.
    src_servers: Vec<String>,

    state: Mutex<ManagerState>,
    apply_lock: ReentrantMutex<()>,
    watchers: Mutex<Vec<(WatcherId, Arc<dyn TopologyWatcher>)>>,
    next_watcher: AtomicU64,
    refresher: Mutex<Option<Weak<dyn ConfigRefresher>>>,
}

impl TopologyManager {
    /// Create a manager whose current topology is `initial`.
    pub fn new(
        bucket_name: impl Into<String>,
        network_override: Option<String>,
        src_servers: Vec<String>,
        initial: Arc<RouteConfig>,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            network_override,
            src_servers,
            state: Mutex::new(ManagerState {
                current: initial,
                seen_config: false,
                network_type: None,
            }),
            apply_lock: ReentrantMutex::new(()),
            watchers: Mutex::new(Vec::new()),
            next_watcher: AtomicU64::new(1),
            refresher: Mutex::new(None),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// The applied topology.
    pub fn current(&self) -> Arc<RouteConfig> {
        self.state.lock().current.clone()
    }

    /// Whether any real topology has been applied.
    pub fn has_seen_config(&self) -> bool {
        self.state.lock().seen_config
    }

    /// The network type, once chosen by the first applied topology.
    pub fn network_type(&self) -> Option<String> {
        self.state.lock().network_type.clone()
    }

    pub fn add_watcher(&self, watcher: Arc<dyn TopologyWatcher>) -> WatcherId {
        let id = WatcherId(self.next_watcher.fetch_add(1, Ordering::Relaxed));
        self.watchers.lock().push((id, watcher));
        id
    }

    pub fn remove_watcher(&self, id: WatcherId) -> bool {
        let mut watchers = self.watchers.lock();
        let before = watchers.len();
        watchers.retain(|(wid, _)| *wid != id);
        watchers.len() != before
    }

    pub fn set_refresher(&self, refresher: Weak<dyn ConfigRefresher>) {
        *self.refresher.lock() = Some(refresher);
    }

    fn refresher(&self) -> Option<Arc<dyn ConfigRefresher>> {
        self.refresher.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Ask the registered refresher for a config.
    pub async fn refresh(&self) {
        match self.refresher() {
            Some(refresher) => refresher.refresh().await,
            None => debug!("no config refresher registered"),
        }
    }

    /// Handle a cluster-map change notification. Ignored unless
    /// `(epoch, rev)` is newer than the applied topology.
    pub fn on_change_notification(&self, epoch: i64, rev: i64) {
        let current = self.current();
        let newer = epoch > current.rev_epoch
            || (epoch == current.rev_epoch && rev > current.rev_id);
        if !newer {
            debug!(epoch, rev, "ignoring stale cluster map notification");
            return;
        }
        if let Some(refresher) = self.refresher() {
            refresher.on_change_notification(epoch, rev);
        }
    }

    /// Propose a candidate topology. Returns true if it was applied.
    pub fn propose_topology(&self, candidate: &BucketConfig) -> bool {
        let _apply = self.apply_lock.lock();

        let (pinned, current) = {
            let state = self.state.lock();
            (state.network_type.clone(), state.current.clone())
        };
        let network_type = match &pinned {
            Some(network_type) => network_type.clone(),
            None => self.select_network_type(candidate),
        };

        let route = Arc::new(RouteConfig::build(
            candidate,
            &network_type,
            &self.bucket_name,
        ));
        if !route.is_valid() {
            debug!(rev_id = route.rev_id, "routing data is not valid, skipping update");
            return false;
        }
        if !self.bucket_name.is_empty() && !route.name.is_empty() && route.name != self.bucket_name
        {
            warn!(bucket = %route.name, expected = %self.bucket_name, "config for another bucket, skipping update");
            return false;
        }
        if !Self::should_apply(&current, &route) {
            return false;
        }

        {
            let mut state = self.state.lock();
            state.current = route.clone();
            state.seen_config = true;
            if state.network_type.is_none() {
                info!(network_type = %network_type, "selected network type");
                state.network_type = Some(network_type);
            }
        }

        info!(
            rev_id = route.rev_id,
            rev_epoch = route.rev_epoch,
            bucket_type = %route.bucket_type,
            "applying new topology"
        );

        let watchers: Vec<Arc<dyn TopologyWatcher>> =
            self.watchers.lock().iter().map(|(_, w)| w.clone()).collect();
        for watcher in watchers {
            watcher.on_new_topology(route.clone());
        }
        true
    }

    fn should_apply(current: &RouteConfig, candidate: &RouteConfig) -> bool {
        if current.is_bootstrap() {
            return true;
        }

        if !current.name.is_empty() && !candidate.name.is_empty() {
            if current.has_vbucket_map() != candidate.has_vbucket_map() {
                warn!(rev_id = candidate.rev_id, "config disagrees on vbucket map presence, skipping update");
                return false;
            }
            if current.num_vbuckets() != candidate.num_vbuckets() {
                warn!(
                    old = current.num_vbuckets(),
                    new = candidate.num_vbuckets(),
                    "config disagrees on vbucket count, skipping update"
                );
                return false;
            }
        }

        if current.bucket_type == BucketType::None && candidate.bucket_type != BucketType::None {
            debug!(bucket_type = %candidate.bucket_type, "bucket selected, applying config");
            return true;
        }

        candidate.is_newer_than(current)
    }

    /// Pick the network for the first topology: the configured override,
    /// then the family containing a bootstrap address, then `external` if
    /// it routes, then `default`.
    fn select_network_type(&self, cfg: &BucketConfig) -> String {
        if let Some(network_type) = &self.network_override {
            return network_type.clone();
        }
        if cfg.nodes_ext.is_empty() {
            return DEFAULT_NETWORK.to_string();
        }

        let contains_source = |route: &RouteConfig| {
            self.src_servers.iter().any(|src| {
                route.kv_endpoints.contains_address(src) || route.mgmt_endpoints.contains_address(src)
            })
        };

        if contains_source(&RouteConfig::build(cfg, DEFAULT_NETWORK, &self.bucket_name)) {
            return DEFAULT_NETWORK.to_string();
        }
        let alternates = cfg.alternate_networks();
        for network in &alternates {
            if contains_source(&RouteConfig::build(cfg, network, &self.bucket_name)) {
                return network.clone();
            }
        }
        if alternates.contains(EXTERNAL_NETWORK)
            && RouteConfig::build(cfg, EXTERNAL_NETWORK, &self.bucket_name).is_valid()
        {
            return EXTERNAL_NETWORK.to_string();
        }
        DEFAULT_NETWORK.to_string()
    }
}
