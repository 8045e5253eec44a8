//! Routing state: one topology plus the pipelines built for it.

use crate::error::Result;
use crate::memd::{ConnectionProvider, KvClient, ResponseHandler};
use crate::pipeline::{ClientDialer, NodePipeline, PipelineContext};
use crate::topology::RouteConfig;
use crate::types::{AuthMechanism, AuthProvider, RouteEndpoint, TlsSettings};
use async_trait::async_trait;
use std::sync::Arc;

/// Connection security and credentials for one connection generation.
///
/// Replaced by a forced reconnect, carried over unchanged by topology
/// changes.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub use_tls: bool,
    pub no_tls_seed_node: bool,
    pub tls: Option<Arc<TlsSettings>>,
    pub auth: Arc<dyn AuthProvider>,
    pub mechanisms: Vec<AuthMechanism>,
}

impl ConnectionSettings {
    /// Whether connections to `endpoint` use TLS.
    pub fn tls_for(&self, endpoint: &RouteEndpoint) -> bool {
        self.use_tls && !(self.no_tls_seed_node && endpoint.is_seed_node)
    }

    /// KV endpoints of `config` this generation connects to.
    pub fn kv_endpoints(&self, config: &RouteConfig) -> Vec<RouteEndpoint> {
        if !self.use_tls {
            return config.kv_endpoints.non_tls.clone();
        }
        config
            .kv_endpoints
            .tls
            .iter()
            .enumerate()
            .map(|(idx, ep)| {
                if self.no_tls_seed_node && ep.is_seed_node {
                    config
                        .kv_endpoints
                        .non_tls
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| ep.clone())
                } else {
                    ep.clone()
                }
            })
            .collect()
    }
}

/// Dials connections for pipelines with one generation's settings.
pub(crate) struct MuxDialer {
    provider: Arc<dyn ConnectionProvider>,
    settings: Arc<ConnectionSettings>,
    handler: Arc<dyn ResponseHandler>,
}

impl MuxDialer {
    pub(crate) fn new(
        provider: Arc<dyn ConnectionProvider>,
        settings: Arc<ConnectionSettings>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            provider,
            settings,
            handler,
        }
    }
}

#[async_trait]
impl ClientDialer for MuxDialer {
    async fn dial(&self, endpoint: &RouteEndpoint) -> Result<Arc<KvClient>> {
        let tls = if self.settings.tls_for(endpoint) {
            self.settings.tls.as_deref()
        } else {
            None
        };
        let conn = self
            .provider
            .dial(
                endpoint,
                tls,
                self.settings.auth.as_ref(),
                &self.settings.mechanisms,
            )
            .await?;
        Ok(KvClient::start(
            endpoint.address.clone(),
            conn,
            self.handler.clone(),
        ))
    }
}

/// An immutable routing generation. Swapped as a whole, never edited.
pub struct RoutingState {
    pub(crate) config: Arc<RouteConfig>,
    pub(crate) pipelines: Vec<Arc<NodePipeline>>,
    pub(crate) dead_pipe: Arc<NodePipeline>,
    pub(crate) settings: Arc<ConnectionSettings>,
    pub(crate) context: Arc<PipelineContext>,
}

impl RoutingState {
    /// Build pipelines for every KV endpoint of `config`. Workers are not
    /// started.
    pub(crate) fn new(
        config: Arc<RouteConfig>,
        settings: Arc<ConnectionSettings>,
        context: Arc<PipelineContext>,
    ) -> Self {
        let pipelines = settings
            .kv_endpoints(&config)
            .into_iter()
            .map(|ep| NodePipeline::new(ep, context.clone()))
            .collect();
        Self {
            dead_pipe: NodePipeline::dead(context.config.max_queue_size),
            config,
            pipelines,
            settings,
            context,
        }
    }

    pub fn config(&self) -> &Arc<RouteConfig> {
        &self.config
    }

    pub fn rev_id(&self) -> i64 {
        self.config.rev_id
    }

    pub fn pipelines(&self) -> &[Arc<NodePipeline>] {
        &self.pipelines
    }

    pub fn pipeline(&self, idx: usize) -> Option<&Arc<NodePipeline>> {
        self.pipelines.get(idx)
    }

    pub fn pipeline_by_address(&self, address: &str) -> Option<&Arc<NodePipeline>> {
        self.pipelines.iter().find(|p| p.address() == address)
    }

    pub fn dead_pipe(&self) -> &Arc<NodePipeline> {
        &self.dead_pipe
    }

    pub fn settings(&self) -> &Arc<ConnectionSettings> {
        &self.settings
    }
}

/// A read-only view of the pipelines of one routing generation.
#[derive(Clone)]
pub struct PipelineSnapshot {
    state: Arc<RoutingState>,
}

impl PipelineSnapshot {
    pub(crate) fn new(state: Arc<RoutingState>) -> Self {
        Self { state }
    }

    pub fn rev_id(&self) -> i64 {
        self.state.rev_id()
    }

    pub fn config(&self) -> &Arc<RouteConfig> {
        self.state.config()
    }

    pub fn num_pipelines(&self) -> usize {
        self.state.pipelines.len()
    }

    pub fn pipeline(&self, idx: usize) -> Option<&Arc<NodePipeline>> {
        self.state.pipeline(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<NodePipeline>> {
        self.state.pipelines.iter()
    }

    /// Every pipeline once, starting at `offset` and wrapping around.
    pub fn iter_from(&self, offset: usize) -> impl Iterator<Item = &Arc<NodePipeline>> {
        let len = self.state.pipelines.len();
        let start = if len == 0 { 0 } else { offset % len };
        self.state.pipelines[start..]
            .iter()
            .chain(self.state.pipelines[..start].iter())
    }

    pub fn addresses(&self) -> Vec<String> {
        self.iter().map(|p| p.address().to_string()).collect()
    }
}
