//! Core types used throughout the routing engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Index of a node within a topology's KV endpoint list.
pub type NodeIndex = usize;

/// Network type that resolves node hostnames to internal addresses.
pub const DEFAULT_NETWORK: &str = "default";

/// Network type that resolves node hostnames to externally advertised addresses.
pub const EXTERNAL_NETWORK: &str = "external";

/// How keys are assigned to nodes for a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketType {
    /// No bucket selected; the topology is cluster-level only.
    None,
    /// Keys map to vbuckets, vbuckets map to nodes.
    Partitioned,
    /// Keys map to nodes through a consistent-hash ring.
    RingHashed,
    /// The topology names a bucket with an unknown locator.
    Invalid,
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketType::None => write!(f, "none"),
            BucketType::Partitioned => write!(f, "partitioned"),
            BucketType::RingHashed => write!(f, "ring-hashed"),
            BucketType::Invalid => write!(f, "invalid"),
        }
    }
}

/// A single service endpoint advertised by a topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEndpoint {
    /// `host:port` for KV endpoints, a URL for HTTP services.
    pub address: String,
    /// Whether the topology was fetched from this node.
    pub is_seed_node: bool,
    /// Server group the node belongs to, empty if none.
    pub server_group: String,
}

impl RouteEndpoint {
    /// Creates an endpoint with no seed flag or server group.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            is_seed_node: false,
            server_group: String::new(),
        }
    }

    /// Marks the endpoint as the seed node.
    pub fn with_seed_node(mut self, is_seed_node: bool) -> Self {
        self.is_seed_node = is_seed_node;
        self
    }

    /// Sets the server group.
    pub fn with_server_group(mut self, group: impl Into<String>) -> Self {
        self.server_group = group.into();
        self
    }
}

/// TLS and non-TLS variants of one service's endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointList {
    pub tls: Vec<RouteEndpoint>,
    pub non_tls: Vec<RouteEndpoint>,
}

impl EndpointList {
    /// Returns the variant matching the connection security mode.
    pub fn select(&self, use_tls: bool) -> &[RouteEndpoint] {
        if use_tls {
            &self.tls
        } else {
            &self.non_tls
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tls.is_empty() && self.non_tls.is_empty()
    }

    /// Returns true if either variant has an endpoint with this address.
    pub fn contains_address(&self, address: &str) -> bool {
        self.tls
            .iter()
            .chain(self.non_tls.iter())
            .any(|ep| ep.address == address)
    }
}

/// Services a node may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    KeyValue,
    Management,
    Views,
    Query,
    Search,
    Analytics,
    Eventing,
}

/// Features a bucket may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketCapability {
    DurableWrites,
    TombstonedUserXattrs,
    CreateAsDeleted,
    ReplaceBodyWithXattr,
    RangeScan,
    ReplicaRead,
    NonDedupedHistory,
    ReviveDocument,
    Collections,
}

impl BucketCapability {
    /// All capabilities resolved for each applied topology.
    pub const ALL: [BucketCapability; 9] = [
        BucketCapability::DurableWrites,
        BucketCapability::TombstonedUserXattrs,
        BucketCapability::CreateAsDeleted,
        BucketCapability::ReplaceBodyWithXattr,
        BucketCapability::RangeScan,
        BucketCapability::ReplicaRead,
        BucketCapability::NonDedupedHistory,
        BucketCapability::ReviveDocument,
        BucketCapability::Collections,
    ];

    /// The name used for this capability in bucket configs.
    pub fn config_name(&self) -> &'static str {
        match self {
            BucketCapability::DurableWrites => "durableWrite",
            BucketCapability::TombstonedUserXattrs => "tombstonedUserXAttrs",
            BucketCapability::CreateAsDeleted => "subdoc.CreateAsDeleted",
            BucketCapability::ReplaceBodyWithXattr => "subdoc.ReplaceBodyWithXattr",
            BucketCapability::RangeScan => "rangeScan",
            BucketCapability::ReplicaRead => "subdoc.ReplicaRead",
            BucketCapability::NonDedupedHistory => "nonDedupedHistory",
            BucketCapability::ReviveDocument => "subdoc.ReviveDocument",
            BucketCapability::Collections => "collections",
        }
    }
}

/// Resolution state of a bucket capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CapabilityStatus {
    /// No config for the expected bucket has been seen yet.
    #[default]
    Unknown,
    Supported,
    Unsupported,
}

/// SASL mechanisms a connection provider may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    Plain,
    ScramSha1,
    ScramSha256,
    ScramSha512,
}

/// Username and password for one endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of credentials for KV and HTTP connections.
pub trait AuthProvider: Send + Sync + fmt::Debug {
    /// Returns the credentials to use for the given endpoint.
    fn credentials(&self, endpoint: &str) -> Credentials;
}

/// Fixed username/password authentication.
#[derive(Debug, Clone)]
pub struct PasswordAuth {
    credentials: Credentials,
}

impl PasswordAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                username: username.into(),
                password: password.into(),
            },
        }
    }
}

impl AuthProvider for PasswordAuth {
    fn credentials(&self, _endpoint: &str) -> Credentials {
        self.credentials.clone()
    }
}

/// TLS settings handed to the connection provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// CA certificate bundle used to verify servers.
    pub ca_cert: Option<PathBuf>,
    /// Skip server certificate verification.
    pub skip_verify: bool,
    /// Server name override for SNI.
    pub server_name: Option<String>,
}

/// Extracts the host part of a `host:port` address, keeping IPv6 brackets.
pub fn host_from_address(address: &str) -> &str {
    if address.starts_with('[') {
        if let Some(end) = address.find(']') {
            return &address[..=end];
        }
    }
    match address.rsplit_once(':') {
        Some((host, _)) => host,
        None => address,
    }
}

/// Formats a hostname and port, bracketing bare IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
