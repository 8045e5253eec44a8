//! Key-to-node routing tables.
//!
//! Two strategies are supported, selected by the bucket type of the applied
//! topology:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Partitioned                                                  │
//! │   key ──crc32──► vbucket ──VbucketMap[vb][replica]──► node   │
//! │                                                              │
//! │ Ring-hashed                                                  │
//! │   key ──md5──► u32 ──KetamaRing (first point ≥ hash)──► node │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both tables are immutable once built; a new topology always builds new
//! tables.

mod ketama;
mod vbucket;

pub use ketama::{KetamaRing, RingPoint, HASHES_PER_NODE, POINTS_PER_HASH};
pub use vbucket::{Crc32KeyHasher, KeyHasher, VbucketMap};
