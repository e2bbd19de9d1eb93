//! Grouping records by key and spreading them over replicas
mod key_partition;
pub mod partitioners;
pub use key_partition::{KeyFunc, KeyPartitioner, PartitionError};
