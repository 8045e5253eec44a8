//! Configuration types for the routing engine.

use crate::types::{AuthMechanism, AuthProvider, PasswordAuth, TlsSettings};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration for a [`RoutingAgent`](crate::RoutingAgent).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bucket to route for. Empty means cluster-level only.
    pub bucket_name: String,

    /// KV `host:port` addresses used before the first topology is known.
    pub seed_kv_addrs: Vec<String>,

    /// Management endpoints (`http://host:port`) used by the HTTP poller
    /// before the first topology is known.
    pub seed_mgmt_endpoints: Vec<String>,

    /// Connect with TLS and route to TLS endpoints.
    pub use_tls: bool,

    /// Network type to resolve hostnames with. `None` or `"auto"` detects it
    /// from the first topology.
    pub network_type: Option<String>,

    /// Use the non-TLS port for the seed node even when TLS is enabled.
    pub no_tls_seed_node: bool,

    /// TLS settings handed to the connection provider.
    pub tls: Option<Arc<TlsSettings>>,

    /// Credentials for KV and HTTP connections.
    pub auth: Arc<dyn AuthProvider>,

    /// SASL mechanisms the connection provider may use.
    pub auth_mechanisms: Vec<AuthMechanism>,

    /// Pipeline configuration.
    pub pipeline: PipelineConfig,

    /// Topology poller configuration.
    pub poller: PollerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            seed_kv_addrs: Vec::new(),
            seed_mgmt_endpoints: Vec::new(),
            use_tls: false,
            network_type: None,
            no_tls_seed_node: false,
            tls: None,
            auth: Arc::new(PasswordAuth::new("", "")),
            auth_mechanisms: vec![AuthMechanism::ScramSha512, AuthMechanism::ScramSha256],
            pipeline: PipelineConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Create a configuration for the given bucket and KV seed addresses.
    pub fn new(bucket_name: impl Into<String>, seed_kv_addrs: Vec<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            seed_kv_addrs,
            ..Default::default()
        }
    }

    /// Set the management endpoints used by the HTTP poller.
    pub fn with_seed_mgmt_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.seed_mgmt_endpoints = endpoints;
        self
    }

    /// Enable or disable TLS.
    pub fn with_tls(mut self, tls: Option<TlsSettings>) -> Self {
        self.use_tls = tls.is_some();
        self.tls = tls.map(Arc::new);
        self
    }

    /// Pin the network type.
    pub fn with_network_type(mut self, network_type: impl Into<String>) -> Self {
        self.network_type = Some(network_type.into());
        self
    }

    /// Use the non-TLS port for the seed node.
    pub fn with_no_tls_seed_node(mut self, enabled: bool) -> Self {
        self.no_tls_seed_node = enabled;
        self
    }

    /// Set the credential source.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Set the SASL mechanisms.
    pub fn with_auth_mechanisms(mut self, mechanisms: Vec<AuthMechanism>) -> Self {
        self.auth_mechanisms = mechanisms;
        self
    }

    /// Set pipeline configuration.
    pub fn with_pipeline_config(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Set poller configuration.
    pub fn with_poller_config(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Returns the network type override, treating `"auto"` as no override.
    pub fn network_type_override(&self) -> Option<&str> {
        match self.network_type.as_deref() {
            None | Some("") | Some("auto") => None,
            Some(nt) => Some(nt),
        }
    }
}

/// Per-node pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Connections per node.
    pub pool_size: usize,

    /// Maximum requests queued per node before dispatch fails with overload.
    pub max_queue_size: usize,

    /// Timeout for establishing one connection.
    pub connect_timeout: Duration,

    /// First delay between reconnect attempts.
    pub reconnect_backoff_min: Duration,

    /// Upper bound on the delay between reconnect attempts.
    pub reconnect_backoff_max: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            max_queue_size: 2048,
            connect_timeout: Duration::from_secs(7),
            reconnect_backoff_min: Duration::from_millis(10),
            reconnect_backoff_max: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Set connections per node.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Set the per-node queue limit.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set reconnect backoff bounds.
    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_backoff_min = min;
        self.reconnect_backoff_max = max.max(min);
        self
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_backoff_min
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max)
    }
}

/// Topology poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Poll topology over KV connections.
    pub cccp_enabled: bool,

    /// Fall back to HTTP streaming when in-protocol polling is unavailable.
    pub http_enabled: bool,

    /// Time between in-protocol polls.
    pub cccp_poll_period: Duration,

    /// Maximum wait for one in-protocol fetch.
    pub cccp_max_wait: Duration,

    /// Wait after an HTTP iteration that produced no topology.
    pub http_retry_delay: Duration,

    /// Maximum lifetime of one HTTP stream before rotating nodes.
    pub http_redial_period: Duration,

    /// Maximum wait for an HTTP stream to open.
    pub http_max_wait: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            cccp_enabled: true,
            http_enabled: true,
            cccp_poll_period: Duration::from_millis(2500),
            cccp_max_wait: Duration::from_secs(3),
            http_retry_delay: Duration::from_secs(10),
            http_redial_period: Duration::from_secs(10),
            http_max_wait: Duration::from_secs(5),
        }
    }
}

impl PollerConfig {
    /// Set the in-protocol poll period.
    pub fn with_cccp_poll_period(mut self, period: Duration) -> Self {
        self.cccp_poll_period = period;
        self
    }

    /// Set the in-protocol fetch timeout.
    pub fn with_cccp_max_wait(mut self, wait: Duration) -> Self {
        self.cccp_max_wait = wait;
        self
    }

    /// Enable or disable in-protocol polling.
    pub fn with_cccp_enabled(mut self, enabled: bool) -> Self {
        self.cccp_enabled = enabled;
        self
    }

    /// Enable or disable HTTP polling.
    pub fn with_http_enabled(mut self, enabled: bool) -> Self {
        self.http_enabled = enabled;
        self
    }

    /// Set the HTTP retry delay.
    pub fn with_http_retry_delay(mut self, delay: Duration) -> Self {
        self.http_retry_delay = delay;
        self
    }

    /// Set the HTTP stream lifetime.
    pub fn with_http_redial_period(mut self, period: Duration) -> Self {
        self.http_redial_period = period;
        self
    }
}
