//! Transmitting a replica's final state exactly once
mod coordinator;
mod once;

pub use coordinator::{
    decode_snapshot, encode_snapshot, FlushCoordinator, FlushResult, SnapshotMessage,
};
pub use once::FlushOnce;
