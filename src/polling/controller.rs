//! Chooses which poller runs and switches between them.

use super::{CccpPoller, HttpPoller, TopologyPoller};
use crate::error::Error;
use crate::topology::{ConfigRefresher, RouteConfig, TopologyWatcher};
use crate::types::BucketType;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivePoller {
    Idle,
    Cccp,
    Http,
}

/// Runs the in-protocol poller, falling back to HTTP streaming when the
/// cluster cannot answer in-protocol, and switching back once a
/// partitioned topology shows up.
pub struct PollerController {
    cccp: Option<Arc<CccpPoller>>,
    http: Option<Arc<HttpPoller>>,
    active: Mutex<ActivePoller>,
    switch_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    weak_self: Weak<Self>,
}

impl PollerController {
    pub fn new(cccp: Option<Arc<CccpPoller>>, http: Option<Arc<HttpPoller>>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            cccp,
            http,
            active: Mutex::new(ActivePoller::Idle),
            switch_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Watcher handle for the topology manager. Holds the controller weakly.
    pub fn watcher(self: &Arc<Self>) -> Arc<dyn TopologyWatcher> {
        let weak = Arc::downgrade(self);
        Arc::new(move |config: Arc<RouteConfig>| {
            if let Some(controller) = weak.upgrade() {
                controller.on_new_topology(&config);
            }
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.cccp.is_some() {
            self.spawn_cccp();
        } else if self.http.is_some() {
            self.spawn_http();
        } else {
            warn!("no topology pollers enabled");
        }
    }

    /// Whether the HTTP poller is the active one.
    pub fn is_http_active(&self) -> bool {
        *self.active.lock() == ActivePoller::Http
    }

    pub fn is_cccp_active(&self) -> bool {
        *self.active.lock() == ActivePoller::Cccp
    }

    pub fn pause(&self, paused: bool) {
        if let Some(cccp) = &self.cccp {
            cccp.pause(paused);
        }
        if let Some(http) = &self.http {
            http.pause(paused);
        }
    }

    /// Error of the active poller.
    pub fn last_error(&self) -> Option<Error> {
        match *self.active.lock() {
            ActivePoller::Cccp => self.cccp.as_ref().and_then(|p| p.last_error()),
            ActivePoller::Http => self.http.as_ref().and_then(|p| p.last_error()),
            ActivePoller::Idle => None,
        }
    }

    pub fn cccp(&self) -> Option<&Arc<CccpPoller>> {
        self.cccp.as_ref()
    }

    /// Stop both pollers and wait for their loops to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        {
            let _guard = self.switch_lock.lock().await;
            *self.active.lock() = ActivePoller::Idle;
            if let Some(cccp) = &self.cccp {
                cccp.stop();
            }
            if let Some(http) = &self.http {
                http.stop();
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        debug!("pollers stopped");
    }

    fn spawn_cccp(self: &Arc<Self>) {
        let Some(cccp) = self.cccp.clone() else {
            return;
        };
        *self.active.lock() = ActivePoller::Cccp;
        let generation = self.generation.load(Ordering::Acquire);
        let stop = cccp.stop_token();
        let controller = self.clone();
        self.tasks.spawn(async move {
            if let Err(err) = cccp.run(stop).await {
                if err.is_polling_fallback() {
                    controller.fallback_to_http(generation).await;
                }
            }
        });
    }

    fn spawn_http(self: &Arc<Self>) {
        let Some(http) = self.http.clone() else {
            return;
        };
        *self.active.lock() = ActivePoller::Http;
        let stop = http.stop_token();
        self.tasks.spawn(async move {
            if let Err(err) = http.run(stop).await {
                warn!(error = %err, "http poller exited");
            }
        });
    }

    async fn fallback_to_http(self: Arc<Self>, generation: u64) {
        let _guard = self.switch_lock.lock().await;
        if self.shutdown.is_cancelled()
            || self.generation.load(Ordering::Acquire) != generation
            || *self.active.lock() != ActivePoller::Cccp
        {
            return;
        }
        let Some(http) = &self.http else {
            warn!("in-protocol polling unavailable and http polling disabled");
            *self.active.lock() = ActivePoller::Idle;
            return;
        };

        info!("falling back to http config polling");
        if let Some(cccp) = &self.cccp {
            cccp.stop();
            cccp.reset();
        }
        http.reset();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.spawn_http();
    }

    async fn switch_to_cccp(self: Arc<Self>, generation: u64) {
        let _guard = self.switch_lock.lock().await;
        if self.shutdown.is_cancelled()
            || self.generation.load(Ordering::Acquire) != generation
            || *self.active.lock() != ActivePoller::Http
        {
            return;
        }
        let Some(cccp) = &self.cccp else {
            return;
        };

        info!("partitioned topology seen, switching back to in-protocol config polling");
        if let Some(http) = &self.http {
            http.stop();
            http.reset();
        }
        cccp.reset();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.spawn_cccp();
    }

    fn on_new_topology(self: Arc<Self>, config: &RouteConfig) {
        if config.bucket_type != BucketType::Partitioned
            || self.cccp.is_none()
            || !self.is_http_active()
        {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("no runtime, not switching pollers");
            return;
        }
        let generation = self.generation.load(Ordering::Acquire);
        tokio::spawn(self.switch_to_cccp(generation));
    }
}

#[async_trait]
impl ConfigRefresher for PollerController {
    async fn refresh(&self) {
        let Some(cccp) = &self.cccp else {
            return;
        };
        if let Err(err) = cccp.refresh_now().await {
            debug!(error = %err, "on-demand config refresh failed");
        }
    }

    fn on_change_notification(&self, epoch: i64, rev: i64) {
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        debug!(epoch, rev, "refreshing after cluster map change notification");
        tokio::spawn(async move {
            controller.refresh().await;
        });
    }
}
