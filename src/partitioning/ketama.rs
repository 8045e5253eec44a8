//! Ketama consistent-hash ring for ring-hashed buckets.
//!
//! Each node contributes 40 MD5 digests of `"{address}-{n}"`, each digest
//! yielding 4 little-endian ring points, for 160 points per node. Addresses
//! are sorted before construction so the ring depends only on the address set.

use crate::error::RoutingError;
use crate::types::NodeIndex;

/// Digests computed per node.
pub const HASHES_PER_NODE: usize = 40;

/// Ring points derived from each digest.
pub const POINTS_PER_HASH: usize = 4;

/// A point on the ring and the node owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPoint {
    pub point: u32,
    /// Index into the address list the ring was built from.
    pub node: NodeIndex,
}

/// A sorted ketama ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KetamaRing {
    points: Vec<RingPoint>,
    addresses: Vec<String>,
}

impl KetamaRing {
    /// Build a ring over `addresses`. Node indexes in the ring refer to
    /// positions in `addresses` as given.
    pub fn new<S: AsRef<str>>(addresses: &[S]) -> Self {
        let mut ordered: Vec<(&str, NodeIndex)> = addresses
            .iter()
            .enumerate()
            .map(|(idx, addr)| (addr.as_ref(), idx))
            .collect();
        ordered.sort();

        let mut points = Vec::with_capacity(ordered.len() * HASHES_PER_NODE * POINTS_PER_HASH);
        for (address, node) in ordered {
            for hh in 0..HASHES_PER_NODE {
                let digest = md5::compute(format!("{}-{}", address, hh));
                for chunk in digest.0.chunks_exact(4) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push(RingPoint { point, node });
                }
            }
        }
        // Stable: equal points keep sorted-address order.
        points.sort_by_key(|p| p.point);

        Self {
            points,
            addresses: addresses.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    }

    /// Hash a key onto the ring.
    pub fn hash(key: &[u8]) -> u32 {
        let digest = md5::compute(key);
        u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
    }

    pub fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[RingPoint] {
        &self.points
    }

    /// Returns the node owning the first point at or after `hash`,
    /// wrapping to the first point.
    pub fn node_by_hash(&self, hash: u32) -> Result<NodeIndex, RoutingError> {
        if self.points.is_empty() {
            return Err(RoutingError::NoRoutingTable);
        }
        let idx = self.points.partition_point(|p| p.point < hash);
        let point = self.points.get(idx).unwrap_or(&self.points[0]);
        Ok(point.node)
    }

    /// Returns the node owning `key`.
    pub fn node_by_key(&self, key: &[u8]) -> Result<NodeIndex, RoutingError> {
        self.node_by_hash(Self::hash(key))
    }

    /// Returns the address owning `key`.
    pub fn address_by_key(&self, key: &[u8]) -> Result<&str, RoutingError> {
        let node = self.node_by_key(key)?;
        self.addresses
            .get(node)
            .map(String::as_str)
            .ok_or(RoutingError::NoRoutingTable)
    }
}
