//! Partitioning functions for distributing a grouped stream across aggregator replicas.
//!
//! All partitioners are pure functions of the key and the replica count. They hash with
//! [seahash], which is stable across processes and Rust versions, so a redelivered record
//! always lands on the replica that saw its key before.
use std::hash::{Hash, Hasher};

use seahash::SeaHasher;

use crate::types::ReplicaId;

/// A function selecting one replica in `0..replica_count` for a key.
pub type Partitioner<K> = fn(&K, u64) -> ReplicaId;

/// Stable 64 bit hash of any hashable value
pub fn stable_hash<V: Hash + ?Sized>(value: &V) -> u64 {
    let mut hasher = SeaHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// A partitioner which uses the key hash as a wrapping index
/// on the set of replicas, i.e. `hash(key) mod replica_count`.
/// This is fast, but leads to **a lot** of data
/// shuffling if the replica count changes between jobs.
///
/// If you plan on changing the replica count, consider [rendezvous_select].
///
/// **PANIC:** if `replica_count` is 0
pub fn hash_select<K: Hash>(key: &K, replica_count: u64) -> ReplicaId {
    assert!(replica_count > 0, "replica count must be positive");
    stable_hash(key) % replica_count
}

/// Select a replica by applying [rendezvous hashing](https://en.wikipedia.org/wiki/Rendezvous_hashing).
/// Rendezvous hashing ensures minimal shuffling when the replica count changes
/// at the cost of being O(n) with n == replica_count
///
/// **PANIC:** if `replica_count` is 0
pub fn rendezvous_select<K: Hash>(key: &K, replica_count: u64) -> ReplicaId {
    let key_hash = stable_hash(key);
    (0..replica_count)
        .map(|replica| (stable_hash(&(key_hash, replica)), replica))
        .max_by_key(|x| x.0)
        .map(|x| x.1)
        .expect("replica count must be positive")
}
