//! Contains tallyflow's message types.
//! Replicas receive their input exclusively via messages, which may contain
//! data or signal the end of the stream.

use serde::{Deserialize, Serialize};

/// A record which gets processed by a replica.
/// The key is the record's grouping key, extracted once when the record is partitioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataMessage<K, V> {
    /// Grouping key of the record
    pub key: K,
    /// The record itself
    pub value: V,
}
impl<K, V> DataMessage<K, V> {
    /// Wrap a record and its grouping key
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// Content variants of a message delivered to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<K, V> {
    /// A single record
    Data(DataMessage<K, V>),
    /// The input for this replica is exhausted. Only the first occurrence has any effect.
    StreamEnd,
}

impl<K, V> From<DataMessage<K, V>> for Message<K, V> {
    fn from(value: DataMessage<K, V>) -> Self {
        Message::Data(value)
    }
}

impl<K, V> Message<K, V> {
    /// True if this is the stream end marker
    pub fn is_stream_end(&self) -> bool {
        matches!(self, Message::StreamEnd)
    }
}

/// An opaque unit of delivery. A batch holds zero or more messages, at most
/// `batch_size` of which are data messages.
pub type Batch<K, V> = Vec<Message<K, V>>;
