//! Wires the topology manager, the mux and the pollers together.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::memd::ConnectionProvider;
use crate::mux::{ConnectionSettings, KvMux};
use crate::pipeline::Request;
use crate::polling::{CccpPoller, ConfigStreamer, HttpPoller, PollerController};
use crate::retry::StandardRetryOrchestrator;
use crate::topology::{ConfigRefresher, RouteConfig, TopologyManager, WatcherId};
use crate::types::{AuthMechanism, AuthProvider, TlsSettings};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// A connected router for one bucket (or the cluster, with no bucket).
pub struct RoutingAgent {
    config: AgentConfig,
    topology: Arc<TopologyManager>,
    mux: Arc<KvMux>,
    pollers: Arc<PollerController>,
    watchers: Vec<WatcherId>,
}

impl RoutingAgent {
    /// Start routing: seed pipelines connect right away and polling begins.
    /// Requests dispatched before the first topology arrives wait in the
    /// dead pipe.
    pub async fn connect(
        config: AgentConfig,
        provider: Arc<dyn ConnectionProvider>,
        streamer: Arc<dyn ConfigStreamer>,
    ) -> Result<Self> {
        if config.seed_kv_addrs.is_empty() && config.seed_mgmt_endpoints.is_empty() {
            return Err(Error::Config("no seed addresses configured".to_string()));
        }
        info!(
            bucket = %config.bucket_name,
            seeds = config.seed_kv_addrs.len(),
            use_tls = config.use_tls,
            "connecting routing agent"
        );

        let initial = Arc::new(RouteConfig::bootstrap(
            &config.bucket_name,
            &config.seed_kv_addrs,
            &config.seed_mgmt_endpoints,
        ));
        let src_servers = config
            .seed_kv_addrs
            .iter()
            .cloned()
            .chain(config.seed_mgmt_endpoints.iter().map(|ep| {
                ep.split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(ep)
                    .trim_end_matches('/')
                    .to_string()
            }))
            .collect();
        let topology = Arc::new(TopologyManager::new(
            config.bucket_name.clone(),
            config.network_type_override().map(str::to_string),
            src_servers,
            initial,
        ));

        let settings = ConnectionSettings {
            use_tls: config.use_tls,
            no_tls_seed_node: config.no_tls_seed_node,
            tls: config.tls.clone(),
            auth: config.auth.clone(),
            mechanisms: config.auth_mechanisms.clone(),
        };
        let mux = KvMux::new(
            topology.clone(),
            provider,
            settings,
            config.pipeline.clone(),
            Arc::new(StandardRetryOrchestrator),
        );
        mux.start();

        let poller_config = &config.poller;
        let cccp = poller_config.cccp_enabled.then(|| {
            Arc::new(CccpPoller::new(
                mux.clone(),
                poller_config.cccp_poll_period,
                poller_config.cccp_max_wait,
            ))
        });
        let http = poller_config.http_enabled.then(|| {
            Arc::new(HttpPoller::new(
                mux.clone(),
                streamer,
                config.seed_mgmt_endpoints.clone(),
                poller_config.http_retry_delay,
                poller_config.http_redial_period,
                poller_config.http_max_wait,
            ))
        });
        let pollers = PollerController::new(cccp, http);

        let watchers = vec![
            topology.add_watcher(mux.watcher()),
            topology.add_watcher(pollers.watcher()),
        ];
        let refresher: Arc<dyn ConfigRefresher> = pollers.clone();
        topology.set_refresher(Arc::downgrade(&refresher));
        pollers.start();

        Ok(Self {
            config,
            topology,
            mux,
            pollers,
            watchers,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn mux(&self) -> &Arc<KvMux> {
        &self.mux
    }

    pub fn pollers(&self) -> &Arc<PollerController> {
        &self.pollers
    }

    /// Route and queue a request. See [`KvMux::dispatch`].
    pub fn dispatch(&self, req: Arc<Request>) -> Result<()> {
        self.mux.dispatch(req)
    }

    /// Send a request to the node at `address`.
    pub fn dispatch_to_address(&self, req: Arc<Request>, address: &str) -> Result<()> {
        self.mux.dispatch_to_address(req, address)
    }

    /// Wait for the first topology. On timeout, the pollers' last error is
    /// returned when there is one.
    pub async fn wait_until_ready(&self, deadline: Instant) -> Result<()> {
        match self.mux.wait_for_config(deadline).await {
            Ok(_) => Ok(()),
            Err(Error::Timeout { ambiguous }) => {
                Err(self.pollers.last_error().unwrap_or(Error::Timeout { ambiguous }))
            }
            Err(err) => Err(err),
        }
    }

    /// Reconnect every pipeline with new security settings and credentials.
    pub fn force_reconnect(
        &self,
        tls: Option<TlsSettings>,
        auth: Arc<dyn AuthProvider>,
        mechanisms: Vec<AuthMechanism>,
    ) {
        self.mux.force_reconnect(tls.map(Arc::new), auth, mechanisms);
    }

    /// Stop polling, then close the mux. Queued requests fail with
    /// [`Error::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        info!(bucket = %self.config.bucket_name, "closing routing agent");
        self.pollers.stop().await;
        for id in &self.watchers {
            self.topology.remove_watcher(*id);
        }
        self.mux.close().await
    }
}
