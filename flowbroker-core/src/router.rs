use crate::types::{PartitionId, START_PARTITION_ID};
use sha2::{Digest, Sha256};

/// Deterministically map a correlation key to a partition id:
/// `START_PARTITION_ID + hash(key) mod partition_count`.
///
/// Publishers and subscribers compute the target partition independently, so
/// the hash must be stable across processes, restarts and cluster members —
/// which rules out the std hasher. The same SHA-256 digest is reused here
/// that already versions snapshots elsewhere in the broker.
///
/// `partition_count` of zero is a programming error and panics.
pub fn partition_for(correlation_key: &[u8], partition_count: u32) -> PartitionId {
    assert!(partition_count > 0, "partition_count must be positive");

    let digest = Sha256::digest(correlation_key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);

    START_PARTITION_ID + (hash % partition_count as u64) as PartitionId
}
