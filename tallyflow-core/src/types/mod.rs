//! Types and traits used across tallyflow
mod data;
mod key;
mod message;

pub use data::Data;
pub use key::Key;
pub use message::{Batch, DataMessage, Message};

/// Uniquely identifies one replica of the aggregation stage.
/// Replica ids are always in `0..replica_count`.
pub type ReplicaId = u64;
