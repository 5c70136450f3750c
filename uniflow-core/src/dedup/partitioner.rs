//! Assigns every dedup key to a shard. The key bytes are read as a single unsigned
//! big-endian integer and reduced modulo the shard count, so the assignment depends
//! only on the key bytes and the shard count. No process-local seed is involved;
//! the same key lands on the same shard across restarts and across processes.

use crate::message::DedupKey;

/// Returns the shard `key` belongs to, in `0..shard_count`.
///
/// The big-endian value of the key is folded byte by byte with the modulus applied
/// at every step, so keys of any length are handled without widening beyond u64.
pub fn shard_for(key: &DedupKey, shard_count: u16) -> u16 {
    debug_assert!(shard_count > 0, "shard_count must be non-zero");
    let modulus = u64::from(shard_count.max(1));
    let shard = key
        .as_ref()
        .iter()
        .fold(0u64, |acc, &byte| ((acc << 8) + u64::from(byte)) % modulus);
    shard as u16
}
