//! Terse bucket/cluster config as served by the cluster.

use crate::error::TopologyError;
use crate::types::{host_from_address, BucketType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Ports a node advertises for each service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServicePorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kv: Option<u16>,
    #[serde(rename = "kvSSL", default, skip_serializing_if = "Option::is_none")]
    pub kv_ssl: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgmt: Option<u16>,
    #[serde(rename = "mgmtSSL", default, skip_serializing_if = "Option::is_none")]
    pub mgmt_ssl: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capi: Option<u16>,
    #[serde(rename = "capiSSL", default, skip_serializing_if = "Option::is_none")]
    pub capi_ssl: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n1ql: Option<u16>,
    #[serde(rename = "n1qlSSL", default, skip_serializing_if = "Option::is_none")]
    pub n1ql_ssl: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fts: Option<u16>,
    #[serde(rename = "ftsSSL", default, skip_serializing_if = "Option::is_none")]
    pub fts_ssl: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cbas: Option<u16>,
    #[serde(rename = "cbasSSL", default, skip_serializing_if = "Option::is_none")]
    pub cbas_ssl: Option<u16>,
    #[serde(rename = "eventingAdminPort", default, skip_serializing_if = "Option::is_none")]
    pub eventing: Option<u16>,
    #[serde(rename = "eventingSSL", default, skip_serializing_if = "Option::is_none")]
    pub eventing_ssl: Option<u16>,
}

/// An alternate address family for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AlternateAddress {
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<ServicePorts>,
}

/// One entry of `nodesExt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigNodeExt {
    #[serde(default)]
    pub services: ServicePorts,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub this_node: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub alternate_addresses: HashMap<String, AlternateAddress>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_group: String,
}

/// One entry of the legacy `nodes` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigNode {
    /// `host:mgmtPort`.
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

/// The `vBucketServerMap` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VbucketServerMap {
    #[serde(default)]
    pub hash_algorithm: String,
    #[serde(default)]
    pub num_replicas: usize,
    #[serde(default)]
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap", default)]
    pub vbucket_map: Vec<Vec<i32>>,
}

/// A parsed cluster or bucket config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    #[serde(default)]
    pub rev: i64,
    #[serde(default)]
    pub rev_epoch: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub node_locator: String,
    #[serde(default)]
    pub nodes: Vec<ConfigNode>,
    #[serde(default)]
    pub nodes_ext: Vec<ConfigNodeExt>,
    #[serde(rename = "vBucketServerMap", default, skip_serializing_if = "Option::is_none")]
    pub vbucket_server_map: Option<VbucketServerMap>,
    #[serde(default)]
    pub bucket_capabilities: Vec<String>,
    #[serde(default)]
    pub cluster_capabilities_ver: Vec<i64>,
    #[serde(default)]
    pub cluster_capabilities: HashMap<String, Vec<String>>,

    /// Host of the node this config was fetched from.
    #[serde(skip)]
    pub source_hostname: String,
}

impl BucketConfig {
    /// Parse a config fetched from `source_address` (`host:port` or a URL
    /// host), substituting `$HOST` with that host.
    pub fn parse(data: &[u8], source_host: &str) -> Result<Self, TopologyError> {
        let text = std::str::from_utf8(data).map_err(|e| TopologyError::Parse(e.to_string()))?;
        let text = text.replace("$HOST", source_host);
        let mut config: BucketConfig = serde_json::from_str(&text)?;
        config.source_hostname = source_host.to_string();
        Ok(config)
    }

    /// Parse a config fetched over a connection to `address` (`host:port`).
    pub fn parse_from_address(data: &[u8], address: &str) -> Result<Self, TopologyError> {
        Self::parse(data, host_from_address(address))
    }

    pub fn bucket_type(&self) -> BucketType {
        match self.node_locator.as_str() {
            "ketama" => BucketType::RingHashed,
            "vbucket" => BucketType::Partitioned,
            _ if self.name.is_empty() && self.uuid.is_empty() => BucketType::None,
            _ => BucketType::Invalid,
        }
    }

    pub fn has_bucket_capability(&self, name: &str) -> bool {
        self.bucket_capabilities.iter().any(|c| c == name)
    }

    /// Alternate network names advertised by any node, sorted.
    pub fn alternate_networks(&self) -> BTreeSet<String> {
        self.nodes_ext
            .iter()
            .flat_map(|n| n.alternate_addresses.keys().cloned())
            .collect()
    }
}
