//! Vbucket map for partitioned buckets.
//!
//! Keys hash to one of a fixed number of vbuckets; each vbucket names one
//! active node and `num_replicas` replica nodes by index into the topology's
//! KV server list. An index of `-1` means the slot is currently unassigned.

use crate::error::RoutingError;
use crate::types::NodeIndex;
use crc::{Crc, CRC_32_ISO_HDLC};
use std::fmt;
use std::sync::Arc;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Maps a key onto a vbucket id.
pub trait KeyHasher: Send + Sync + fmt::Debug {
    /// Returns the vbucket for `key` in a map of `num_vbuckets` entries.
    fn vbucket_for_key(&self, key: &[u8], num_vbuckets: usize) -> u16;
}

/// CRC32 (IEEE) based key hashing: bits 16..31 of the checksum, masked to 15
/// bits, modulo the vbucket count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32KeyHasher;

impl KeyHasher for Crc32KeyHasher {
    fn vbucket_for_key(&self, key: &[u8], num_vbuckets: usize) -> u16 {
        if num_vbuckets == 0 {
            return 0;
        }
        let crc = CRC32.checksum(key);
        let mid = ((crc >> 16) & 0x7fff) as usize;
        (mid % num_vbuckets) as u16
    }
}

/// Active and replica assignment for every vbucket.
#[derive(Clone)]
pub struct VbucketMap {
    entries: Vec<Vec<i32>>,
    num_replicas: usize,
    hasher: Arc<dyn KeyHasher>,
}

impl fmt::Debug for VbucketMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VbucketMap")
            .field("num_vbuckets", &self.entries.len())
            .field("num_replicas", &self.num_replicas)
            .field("hasher", &self.hasher)
            .finish()
    }
}

impl PartialEq for VbucketMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries && self.num_replicas == other.num_replicas
    }
}

impl VbucketMap {
    /// Create a map using CRC32 key hashing.
    pub fn new(entries: Vec<Vec<i32>>, num_replicas: usize) -> Self {
        Self::with_hasher(entries, num_replicas, Arc::new(Crc32KeyHasher))
    }

    /// Create a map with a custom key hashing policy.
    pub fn with_hasher(
        entries: Vec<Vec<i32>>,
        num_replicas: usize,
        hasher: Arc<dyn KeyHasher>,
    ) -> Self {
        Self {
            entries,
            num_replicas,
            hasher,
        }
    }

    pub fn num_vbuckets(&self) -> usize {
        self.entries.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn entries(&self) -> &[Vec<i32>] {
        &self.entries
    }

    /// Checks the map is usable against a server list of `num_servers`.
    ///
    /// Every entry must have exactly `num_replicas + 1` slots and each slot
    /// must be `-1` or a valid server index.
    pub fn is_valid(&self, num_servers: usize) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.entries.iter().all(|entry| {
            entry.len() == self.num_replicas + 1
                && entry
                    .iter()
                    .all(|&idx| idx == -1 || (idx >= 0 && (idx as usize) < num_servers))
        })
    }

    /// Returns the vbucket owning `key`.
    pub fn vbucket_by_key(&self, key: &[u8]) -> u16 {
        self.hasher.vbucket_for_key(key, self.entries.len())
    }

    /// Returns the node serving `replica_idx` of `vbucket`.
    ///
    /// `Ok(None)` means the slot is unassigned; requests for it should wait
    /// for the next topology.
    pub fn node_by_vbucket(
        &self,
        vbucket: u16,
        replica_idx: usize,
    ) -> Result<Option<NodeIndex>, RoutingError> {
        let entry = self
            .entries
            .get(vbucket as usize)
            .ok_or(RoutingError::InvalidVbucket {
                vbucket,
                num_vbuckets: self.entries.len(),
            })?;

        let idx = entry
            .get(replica_idx)
            .ok_or(RoutingError::InvalidReplica {
                index: replica_idx as i32,
                num_replicas: self.num_replicas,
            })?;

        if *idx < 0 {
            Ok(None)
        } else {
            Ok(Some(*idx as NodeIndex))
        }
    }

    /// Returns the node serving `replica_idx` for `key`.
    pub fn node_by_key(
        &self,
        key: &[u8],
        replica_idx: usize,
    ) -> Result<Option<NodeIndex>, RoutingError> {
        self.node_by_vbucket(self.vbucket_by_key(key), replica_idx)
    }

    /// Returns every vbucket whose active copy lives on `node`.
    pub fn vbuckets_by_server(&self, node: NodeIndex) -> Vec<u16> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.first().copied() == Some(node as i32))
            .map(|(vb, _)| vb as u16)
            .collect()
    }
}
