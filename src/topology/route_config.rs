//! Immutable routing snapshot built from a bucket config.

use super::bucket_config::{BucketConfig, ServicePorts};
use crate::partitioning::{KetamaRing, VbucketMap};
use crate::types::{
    host_from_address, join_host_port, BucketCapability, BucketType, CapabilityStatus,
    EndpointList, RouteEndpoint, DEFAULT_NETWORK,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// One version of the cluster as seen by the router.
///
/// Never mutated once built; every applied topology is a fresh value.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    pub rev_id: i64,
    pub rev_epoch: i64,
    pub uuid: String,
    pub name: String,
    pub bucket_type: BucketType,

    pub kv_endpoints: EndpointList,
    pub mgmt_endpoints: EndpointList,
    pub views_endpoints: EndpointList,
    pub query_endpoints: EndpointList,
    pub search_endpoints: EndpointList,
    pub analytics_endpoints: EndpointList,
    pub eventing_endpoints: EndpointList,

    pub vbucket_map: Option<VbucketMap>,
    pub ketama_ring: Option<KetamaRing>,

    pub cluster_capabilities_ver: Vec<i64>,
    pub cluster_capabilities: HashMap<String, Vec<String>>,
    bucket_capabilities: HashMap<BucketCapability, CapabilityStatus>,
}

/// A node with its address family resolved.
struct ResolvedNode {
    host: String,
    ports: ServicePorts,
    /// KV address on the default network, as it appears in `serverList`.
    default_kv: Option<String>,
    is_seed_node: bool,
    server_group: String,
}

impl RouteConfig {
    /// Placeholder used before any topology is known: revision `-1`, KV
    /// endpoints from the seed list.
    pub fn bootstrap(bucket_name: &str, seed_kv: &[String], seed_mgmt: &[String]) -> Self {
        let kv: Vec<RouteEndpoint> = seed_kv.iter().map(RouteEndpoint::new).collect();
        let mgmt: Vec<RouteEndpoint> = seed_mgmt.iter().map(RouteEndpoint::new).collect();
        Self {
            rev_id: -1,
            rev_epoch: 0,
            uuid: String::new(),
            name: bucket_name.to_string(),
            bucket_type: if bucket_name.is_empty() {
                BucketType::None
            } else {
                BucketType::Invalid
            },
            kv_endpoints: EndpointList {
                tls: kv.clone(),
                non_tls: kv,
            },
            mgmt_endpoints: EndpointList {
                tls: mgmt.clone(),
                non_tls: mgmt,
            },
            views_endpoints: EndpointList::default(),
            query_endpoints: EndpointList::default(),
            search_endpoints: EndpointList::default(),
            analytics_endpoints: EndpointList::default(),
            eventing_endpoints: EndpointList::default(),
            vbucket_map: None,
            ketama_ring: None,
            cluster_capabilities_ver: Vec::new(),
            cluster_capabilities: HashMap::new(),
            bucket_capabilities: HashMap::new(),
        }
    }

    /// Build a snapshot from `cfg`, resolving hostnames through
    /// `network_type`. Capabilities resolve only when `cfg` names
    /// `expected_bucket`.
    pub fn build(cfg: &BucketConfig, network_type: &str, expected_bucket: &str) -> Self {
        let bucket_type = cfg.bucket_type();
        let nodes = resolve_nodes(cfg, network_type);

        let mut route = Self {
            rev_id: cfg.rev,
            rev_epoch: cfg.rev_epoch,
            uuid: cfg.uuid.clone(),
            name: cfg.name.clone(),
            bucket_type,
            kv_endpoints: EndpointList::default(),
            mgmt_endpoints: EndpointList::default(),
            views_endpoints: EndpointList::default(),
            query_endpoints: EndpointList::default(),
            search_endpoints: EndpointList::default(),
            analytics_endpoints: EndpointList::default(),
            eventing_endpoints: EndpointList::default(),
            vbucket_map: None,
            ketama_ring: None,
            cluster_capabilities_ver: cfg.cluster_capabilities_ver.clone(),
            cluster_capabilities: cfg.cluster_capabilities.clone(),
            bucket_capabilities: HashMap::new(),
        };

        route.kv_endpoints = kv_endpoints(cfg, bucket_type, &nodes);
        for node in &nodes {
            let p = &node.ports;
            push_http(&mut route.mgmt_endpoints, node, p.mgmt, p.mgmt_ssl);
            push_http(&mut route.views_endpoints, node, p.capi, p.capi_ssl);
            push_http(&mut route.query_endpoints, node, p.n1ql, p.n1ql_ssl);
            push_http(&mut route.search_endpoints, node, p.fts, p.fts_ssl);
            push_http(&mut route.analytics_endpoints, node, p.cbas, p.cbas_ssl);
            push_http(&mut route.eventing_endpoints, node, p.eventing, p.eventing_ssl);
        }

        match bucket_type {
            BucketType::Partitioned => {
                if let Some(map) = &cfg.vbucket_server_map {
                    route.vbucket_map =
                        Some(VbucketMap::new(map.vbucket_map.clone(), map.num_replicas));
                }
            }
            BucketType::RingHashed => {
                let addresses: Vec<&str> = route
                    .kv_endpoints
                    .non_tls
                    .iter()
                    .map(|ep| ep.address.as_str())
                    .collect();
                route.ketama_ring = Some(KetamaRing::new(&addresses));
            }
            BucketType::None | BucketType::Invalid => {}
        }

        if cfg.name == expected_bucket && cfg.rev > -1 {
            for cap in BucketCapability::ALL {
                let status = if cfg.has_bucket_capability(cap.config_name()) {
                    CapabilityStatus::Supported
                } else {
                    CapabilityStatus::Unsupported
                };
                route.bucket_capabilities.insert(cap, status);
            }
        }

        route
    }

    /// Whether the snapshot can route requests.
    pub fn is_valid(&self) -> bool {
        if self.bucket_type == BucketType::None {
            return true;
        }
        if self.kv_endpoints.tls.is_empty() || self.kv_endpoints.non_tls.is_empty() {
            return false;
        }
        match self.bucket_type {
            BucketType::Partitioned => self
                .vbucket_map
                .as_ref()
                .is_some_and(|map| map.is_valid(self.kv_endpoints.non_tls.len())),
            BucketType::RingHashed => self.ketama_ring.as_ref().is_some_and(|r| r.is_valid()),
            BucketType::None => true,
            BucketType::Invalid => false,
        }
    }

    /// Revision ordering: epoch first, then revision id. A revision id of
    /// `0` within the same epoch is unversioned and always newer.
    pub fn is_newer_than(&self, old: &RouteConfig) -> bool {
        if self.rev_epoch < old.rev_epoch {
            debug!(
                new_epoch = self.rev_epoch,
                old_epoch = old.rev_epoch,
                "ignoring config with older epoch"
            );
            return false;
        }
        if self.rev_epoch > old.rev_epoch {
            return true;
        }
        if self.rev_id == 0 {
            debug!("applying unversioned config");
            return true;
        }
        if self.rev_id <= old.rev_id {
            debug!(
                new_rev = self.rev_id,
                old_rev = old.rev_id,
                "ignoring config with older or equal revision"
            );
            return false;
        }
        true
    }

    /// Whether this is a placeholder built before any topology arrived.
    pub fn is_bootstrap(&self) -> bool {
        self.rev_id == -1
    }

    pub fn has_vbucket_map(&self) -> bool {
        self.vbucket_map.is_some()
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_map.as_ref().map_or(0, |m| m.num_vbuckets())
    }

    pub fn num_replicas(&self) -> usize {
        self.vbucket_map.as_ref().map_or(0, |m| m.num_replicas())
    }

    pub fn capability_status(&self, cap: BucketCapability) -> CapabilityStatus {
        self.bucket_capabilities
            .get(&cap)
            .copied()
            .unwrap_or_default()
    }

    pub fn has_cluster_capability(&self, category: &str, name: &str) -> bool {
        self.cluster_capabilities
            .get(category)
            .is_some_and(|caps| caps.iter().any(|c| c == name))
    }
}

fn resolve_nodes(cfg: &BucketConfig, network_type: &str) -> Vec<ResolvedNode> {
    if cfg.nodes_ext.is_empty() {
        return legacy_nodes(cfg);
    }

    let mut nodes = Vec::with_capacity(cfg.nodes_ext.len());
    for node in &cfg.nodes_ext {
        let hostname = if node.hostname.is_empty() {
            cfg.source_hostname.as_str()
        } else {
            node.hostname.as_str()
        };
        let default_kv = node.services.kv.map(|port| join_host_port(hostname, port));

        let (host, ports) = if network_type == DEFAULT_NETWORK {
            (hostname.to_string(), node.services.clone())
        } else {
            match node.alternate_addresses.get(network_type) {
                Some(alt) => (
                    alt.hostname.clone(),
                    alt.ports.clone().unwrap_or_else(|| node.services.clone()),
                ),
                None => {
                    debug!(hostname, network_type, "node has no alternate address, skipping");
                    continue;
                }
            }
        };

        nodes.push(ResolvedNode {
            host,
            ports,
            default_kv,
            is_seed_node: node.this_node,
            server_group: node.server_group.clone(),
        });
    }
    nodes
}

/// Nodes from the legacy `nodes` list, for configs without `nodesExt`.
fn legacy_nodes(cfg: &BucketConfig) -> Vec<ResolvedNode> {
    cfg.nodes
        .iter()
        .map(|node| {
            let host = host_from_address(&node.hostname).to_string();
            let mgmt = node
                .hostname
                .rsplit_once(':')
                .and_then(|(_, port)| port.parse::<u16>().ok());
            let kv = node.ports.get("direct").copied();
            ResolvedNode {
                default_kv: kv.map(|port| join_host_port(&host, port)),
                host,
                ports: ServicePorts {
                    kv,
                    mgmt,
                    ..ServicePorts::default()
                },
                is_seed_node: false,
                server_group: String::new(),
            }
        })
        .collect()
}

fn endpoint(node: &ResolvedNode, address: String) -> RouteEndpoint {
    RouteEndpoint::new(address)
        .with_seed_node(node.is_seed_node)
        .with_server_group(node.server_group.clone())
}

/// KV lists are index-aligned: entry `i` of both variants is the same node.
/// A node without a TLS port uses its plain address in the TLS list.
fn kv_endpoints(cfg: &BucketConfig, bucket_type: BucketType, nodes: &[ResolvedNode]) -> EndpointList {
    let mut list = EndpointList::default();
    match (&cfg.vbucket_server_map, bucket_type) {
        (Some(map), BucketType::Partitioned) => {
            for server in &map.server_list {
                match nodes
                    .iter()
                    .find(|n| n.default_kv.as_deref() == Some(server.as_str()))
                {
                    Some(node) => push_kv(&mut list, node),
                    None => {
                        // Keep indexes aligned with the vbucket map.
                        warn!(server = %server, "server list entry has no matching node");
                        let ep = RouteEndpoint::new(server.clone());
                        list.non_tls.push(ep.clone());
                        list.tls.push(ep);
                    }
                }
            }
        }
        _ => {
            for node in nodes {
                push_kv(&mut list, node);
            }
        }
    }
    list
}

fn push_kv(list: &mut EndpointList, node: &ResolvedNode) {
    let Some(kv) = node.ports.kv else {
        return;
    };
    let plain = join_host_port(&node.host, kv);
    let tls = node
        .ports
        .kv_ssl
        .map(|port| join_host_port(&node.host, port))
        .unwrap_or_else(|| plain.clone());
    list.non_tls.push(endpoint(node, plain));
    list.tls.push(endpoint(node, tls));
}

fn push_http(list: &mut EndpointList, node: &ResolvedNode, plain: Option<u16>, tls: Option<u16>) {
    if let Some(port) = plain {
        list.non_tls.push(endpoint(
            node,
            format!("http://{}", join_host_port(&node.host, port)),
        ));
    }
    if let Some(port) = tls {
        list.tls.push(endpoint(
            node,
            format!("https://{}", join_host_port(&node.host, port)),
        ));
    }
}
