//! Builders for terse cluster configs.

use bytes::Bytes;
use serde_json::{json, Value};

pub const KV_PORT: u16 = 11210;
pub const KV_TLS_PORT: u16 = 11207;
pub const MGMT_PORT: u16 = 8091;

/// KV address of `host` on the default port.
pub fn kv_addr(host: &str) -> String {
    format!("{}:{}", host, KV_PORT)
}

/// Management endpoint of `host`.
pub fn mgmt_endpoint(host: &str) -> String {
    format!("http://{}:{}", host, MGMT_PORT)
}

/// Builds a terse config for a set of hosts.
///
/// The default vbucket map assigns vbucket `i` to node `i % n` and its
/// replica `r` to node `(i + r + 1) % n`.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    rev: i64,
    rev_epoch: i64,
    name: String,
    uuid: String,
    locator: &'static str,
    hosts: Vec<String>,
    server_groups: Vec<String>,
    num_vbuckets: usize,
    num_replicas: usize,
    map: Option<Vec<Vec<i32>>>,
    bucket_capabilities: Vec<String>,
}

impl ConfigBuilder {
    /// A partitioned bucket config.
    pub fn partitioned(name: &str, hosts: &[&str]) -> Self {
        Self {
            rev: 1,
            rev_epoch: 1,
            name: name.to_string(),
            uuid: format!("{}-uuid", name),
            locator: "vbucket",
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            server_groups: Vec::new(),
            num_vbuckets: 64,
            num_replicas: 1,
            map: None,
            bucket_capabilities: vec!["cccp".to_string(), "collections".to_string()],
        }
    }

    /// A ring-hashed bucket config.
    pub fn ring_hashed(name: &str, hosts: &[&str]) -> Self {
        Self {
            locator: "ketama",
            ..Self::partitioned(name, hosts)
        }
    }

    /// A cluster-level config with no bucket.
    pub fn cluster(hosts: &[&str]) -> Self {
        Self {
            name: String::new(),
            uuid: String::new(),
            locator: "",
            bucket_capabilities: Vec::new(),
            ..Self::partitioned("", hosts)
        }
    }

    pub fn rev(mut self, rev: i64) -> Self {
        self.rev = rev;
        self
    }

    pub fn rev_epoch(mut self, epoch: i64) -> Self {
        self.rev_epoch = epoch;
        self
    }

    pub fn vbuckets(mut self, num_vbuckets: usize, num_replicas: usize) -> Self {
        self.num_vbuckets = num_vbuckets;
        self.num_replicas = num_replicas;
        self
    }

    pub fn map(mut self, map: Vec<Vec<i32>>) -> Self {
        self.map = Some(map);
        self
    }

    /// Server group of each host, by position.
    pub fn server_groups(mut self, groups: &[&str]) -> Self {
        self.server_groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    /// The vbucket map this builder produces.
    pub fn vbucket_map(&self) -> Vec<Vec<i32>> {
        if let Some(map) = &self.map {
            return map.clone();
        }
        let n = self.hosts.len();
        (0..self.num_vbuckets)
            .map(|vb| {
                (0..=self.num_replicas)
                    .map(|r| {
                        if r == 0 {
                            (vb % n) as i32
                        } else if r < n {
                            ((vb + r) % n) as i32
                        } else {
                            -1
                        }
                    })
                    .collect()
            })
            .collect()
    }

    pub fn build(&self) -> Value {
        let nodes_ext: Vec<Value> = self
            .hosts
            .iter()
            .enumerate()
            .map(|(idx, host)| {
                json!({
                    "services": {
                        "kv": KV_PORT,
                        "kvSSL": KV_TLS_PORT,
                        "mgmt": MGMT_PORT,
                        "mgmtSSL": 18091,
                        "n1ql": 8093
                    },
                    "hostname": host,
                    "serverGroup": self.server_groups.get(idx).cloned().unwrap_or_default(),
                })
            })
            .collect();

        let mut config = json!({
            "rev": self.rev,
            "revEpoch": self.rev_epoch,
            "nodesExt": nodes_ext,
            "clusterCapabilitiesVer": [1, 0],
            "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]},
        });
        if !self.name.is_empty() {
            config["name"] = json!(self.name);
            config["uuid"] = json!(self.uuid);
            config["nodeLocator"] = json!(self.locator);
            config["bucketCapabilities"] = json!(self.bucket_capabilities);
        }
        if self.locator == "vbucket" && !self.name.is_empty() {
            let server_list: Vec<String> = self.hosts.iter().map(|h| kv_addr(h)).collect();
            config["vBucketServerMap"] = json!({
                "hashAlgorithm": "CRC",
                "numReplicas": self.num_replicas,
                "serverList": server_list,
                "vBucketMap": self.vbucket_map(),
            });
        }
        config
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::from(self.build().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{BucketConfig, RouteConfig};
    use crate::types::{BucketType, DEFAULT_NETWORK};

    #[test]
    fn test_builder_produces_valid_configs() {
        let builder = ConfigBuilder::partitioned("default", &["a", "b", "c"]).vbuckets(8, 2);
        let cfg = BucketConfig::parse(&builder.bytes(), "a").unwrap();
        let route = RouteConfig::build(&cfg, DEFAULT_NETWORK, "default");
        assert_eq!(route.bucket_type, BucketType::Partitioned);
        assert!(route.is_valid());
        assert_eq!(builder.vbucket_map()[4], vec![1, 2, 0]);

        let cluster = BucketConfig::parse(&ConfigBuilder::cluster(&["a"]).bytes(), "a").unwrap();
        assert_eq!(cluster.bucket_type(), BucketType::None);

        let ring = BucketConfig::parse(&ConfigBuilder::ring_hashed("mc", &["a", "b"]).bytes(), "a")
            .unwrap();
        assert!(RouteConfig::build(&ring, DEFAULT_NETWORK, "mc").is_valid());
    }
}
