//! The transactional messaging substrate a replica flushes its state through.
//!
//! A substrate hands out one [MessagingClient] per replica when the replica starts.
//! Every flush attempt then runs one [Transaction]: a producer is created per egress
//! destination, the snapshot is sent once through each producer, and the transaction
//! is committed. Nothing staged in a transaction is visible downstream before the commit.
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ReplicaId;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use memory::{BrokerStats, CommittedMessage, MemoryBroker};

/// Boxed error of a messaging implementation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A downstream endpoint which must receive exactly one copy of every replica's
/// flushed state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EgressDestination(String);

impl EgressDestination {
    /// Create a destination from its name, e.g. a topic
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Name of this destination
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EgressDestination {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EgressDestination {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for EgressDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A messaging system supporting transactions spanning multiple destinations
pub trait Messaging: Send + Sync + 'static {
    /// Client used by a single replica
    type Client: MessagingClient;

    /// Open the client a replica uses for its whole lifetime
    fn connect(&self, replica: ReplicaId) -> Result<Self::Client, TransmissionError>;
}

/// Per-replica handle on the messaging substrate
pub trait MessagingClient: Send + Sync + 'static {
    /// A single transaction
    type Transaction: Transaction;

    /// Open a new transaction
    fn begin(&self) -> Result<Self::Transaction, TransmissionError>;
}

/// An open transaction. Must be ended by either [Transaction::commit] or [Transaction::abort].
pub trait Transaction {
    /// Producer bound to one destination. Dropping the producer releases it.
    type Producer: EgressProducer;

    /// Create a producer sending to `destination` within this transaction
    fn producer(
        &mut self,
        destination: &EgressDestination,
    ) -> Result<Self::Producer, TransmissionError>;

    /// Commit everything sent in this transaction.
    /// If the commit fails, the transaction is aborted and none of its messages become visible.
    fn commit(self) -> Result<(), TransmissionError>;

    /// Discard everything sent in this transaction
    fn abort(self);
}

/// Sends messages to one destination as part of a transaction
pub trait EgressProducer {
    /// Stage a message for the destination
    fn send(&mut self, payload: &[u8]) -> Result<(), TransmissionError>;
}

/// Errors occuring while transmitting a flush result
#[derive(Debug, Error)]
pub enum TransmissionError {
    /// Could not open the replica's client
    #[error("Failed to connect to messaging substrate")]
    Connect(#[source] BoxError),
    /// Could not begin a transaction
    #[error("Failed to begin transaction")]
    Begin(#[source] BoxError),
    /// Could not create a producer
    #[error("Failed to create producer for destination '{0}'")]
    CreateProducer(EgressDestination, #[source] BoxError),
    /// Could not send to a destination
    #[error("Failed to send snapshot to destination '{0}'")]
    Send(EgressDestination, #[source] BoxError),
    /// Could not commit the transaction
    #[error("Failed to commit transaction")]
    Commit(#[source] BoxError),
    /// Could not encode the snapshot
    #[error("Failed to encode snapshot")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl TransmissionError {
    /// Whether re-running the whole transmission may succeed.
    /// Nothing is committed downstream before a transaction commits, so all substrate
    /// failures are retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransmissionError::Encode(_))
    }
}
