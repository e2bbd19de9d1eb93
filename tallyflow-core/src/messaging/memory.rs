//! An in-process transactional messaging substrate.
//!
//! Messages only become visible in a destination's log when the transaction they were sent
//! in commits. Faults can be injected on every step of the handshake, which makes this
//! the substrate of choice for local runs and tests.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::types::ReplicaId;

use super::{
    EgressDestination, EgressProducer, Messaging, MessagingClient, Transaction, TransmissionError,
};

/// A message which was committed to a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedMessage {
    /// Replica which sent the message
    pub replica: ReplicaId,
    /// Message content
    pub payload: Vec<u8>,
}

/// Counters of everything that happened on a [MemoryBroker]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Clients connected
    pub connections: u64,
    /// Transactions begun
    pub transactions: u64,
    /// Producers created
    pub producers: u64,
    /// Messages staged by producers
    pub messages_sent: u64,
    /// Transactions committed
    pub commits: u64,
    /// Transactions aborted, including failed commits
    pub aborts: u64,
}

#[derive(Debug, Default)]
struct Faults {
    connect: u32,
    begin: u32,
    producer: u32,
    commit: u32,
    send: IndexMap<EgressDestination, u32>,
}

/// Take one injected fault if any are left
fn trip(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    committed: IndexMap<EgressDestination, Vec<CommittedMessage>>,
    stats: BrokerStats,
    faults: Faults,
}

/// In-memory transactional broker.
/// This struct uses an `Arc<Mutex<_>>` internally, so it can be freely
/// cloned and shared between replicas.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create a new empty broker
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // state is only mutated in small, non-panicking sections
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` connection attempts
    pub fn fail_connect(&self, times: u32) {
        self.lock().faults.connect += times;
    }

    /// Fail the next `times` attempts to begin a transaction
    pub fn fail_begin(&self, times: u32) {
        self.lock().faults.begin += times;
    }

    /// Fail the next `times` attempts to create a producer
    pub fn fail_producer(&self, times: u32) {
        self.lock().faults.producer += times;
    }

    /// Fail the next `times` commits
    pub fn fail_commit(&self, times: u32) {
        self.lock().faults.commit += times;
    }

    /// Fail the next `times` sends to `destination`
    pub fn fail_send(&self, destination: impl Into<EgressDestination>, times: u32) {
        *self
            .lock()
            .faults
            .send
            .entry(destination.into())
            .or_default() += times;
    }

    /// All messages committed to a destination, in commit order
    pub fn committed(&self, destination: &EgressDestination) -> Vec<CommittedMessage> {
        self.lock()
            .committed
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Current counters
    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }
}

impl Messaging for MemoryBroker {
    type Client = MemoryClient;

    fn connect(&self, replica: ReplicaId) -> Result<Self::Client, TransmissionError> {
        let mut state = self.lock();
        if trip(&mut state.faults.connect) {
            return Err(TransmissionError::Connect(
                MemoryBrokerError::Injected("connect").into(),
            ));
        }
        state.stats.connections += 1;
        Ok(MemoryClient {
            broker: self.clone(),
            replica,
        })
    }
}

/// Client of a single replica on a [MemoryBroker]
#[derive(Debug, Clone)]
pub struct MemoryClient {
    broker: MemoryBroker,
    replica: ReplicaId,
}

impl MessagingClient for MemoryClient {
    type Transaction = MemoryTransaction;

    fn begin(&self) -> Result<Self::Transaction, TransmissionError> {
        let mut state = self.broker.lock();
        if trip(&mut state.faults.begin) {
            return Err(TransmissionError::Begin(
                MemoryBrokerError::Injected("begin").into(),
            ));
        }
        state.stats.transactions += 1;
        Ok(MemoryTransaction {
            broker: self.broker.clone(),
            replica: self.replica,
            staged: Arc::default(),
        })
    }
}

type Staged = Arc<Mutex<Vec<(EgressDestination, Vec<u8>)>>>;

/// An open transaction on a [MemoryBroker]
#[derive(Debug)]
pub struct MemoryTransaction {
    broker: MemoryBroker,
    replica: ReplicaId,
    staged: Staged,
}

impl MemoryTransaction {
    fn take_staged(&self) -> Vec<(EgressDestination, Vec<u8>)> {
        std::mem::take(&mut *self.staged.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Transaction for MemoryTransaction {
    type Producer = MemoryProducer;

    fn producer(
        &mut self,
        destination: &EgressDestination,
    ) -> Result<Self::Producer, TransmissionError> {
        let mut state = self.broker.lock();
        if trip(&mut state.faults.producer) {
            return Err(TransmissionError::CreateProducer(
                destination.clone(),
                MemoryBrokerError::Injected("producer").into(),
            ));
        }
        state.stats.producers += 1;
        Ok(MemoryProducer {
            broker: self.broker.clone(),
            destination: destination.clone(),
            staged: Arc::clone(&self.staged),
        })
    }

    fn commit(self) -> Result<(), TransmissionError> {
        let staged = self.take_staged();
        let mut state = self.broker.lock();
        if trip(&mut state.faults.commit) {
            state.stats.aborts += 1;
            debug!(replica = self.replica, "Injected commit failure, discarding {} messages", staged.len());
            return Err(TransmissionError::Commit(
                MemoryBrokerError::Injected("commit").into(),
            ));
        }
        for (destination, payload) in staged {
            state
                .committed
                .entry(destination)
                .or_default()
                .push(CommittedMessage {
                    replica: self.replica,
                    payload,
                });
        }
        state.stats.commits += 1;
        Ok(())
    }

    fn abort(self) {
        let staged = self.take_staged();
        debug!(replica = self.replica, "Aborting transaction with {} staged messages", staged.len());
        self.broker.lock().stats.aborts += 1;
    }
}

/// Producer for a single destination within a [MemoryTransaction]
#[derive(Debug)]
pub struct MemoryProducer {
    broker: MemoryBroker,
    destination: EgressDestination,
    staged: Staged,
}

impl EgressProducer for MemoryProducer {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransmissionError> {
        let mut state = self.broker.lock();
        if let Some(remaining) = state.faults.send.get_mut(&self.destination) {
            if trip(remaining) {
                return Err(TransmissionError::Send(
                    self.destination.clone(),
                    MemoryBrokerError::Injected("send").into(),
                ));
            }
        }
        state.stats.messages_sent += 1;
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.destination.clone(), payload.to_vec()));
        Ok(())
    }
}

/// Errors raised by the [MemoryBroker]
#[derive(Debug, Error)]
pub enum MemoryBrokerError {
    /// A fault injected via one of the `fail_*` methods
    #[error("Injected {0} failure")]
    Injected(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(name: &str) -> EgressDestination {
        EgressDestination::from(name)
    }

    #[test]
    fn commit_makes_visible() {
        let broker = MemoryBroker::new();
        let client = broker.connect(3).unwrap();
        let mut tx = client.begin().unwrap();
        let mut producer = tx.producer(&dest("a")).unwrap();
        producer.send(b"hello").unwrap();
        drop(producer);
        assert!(broker.committed(&dest("a")).is_empty());

        tx.commit().unwrap();
        assert_eq!(
            broker.committed(&dest("a")),
            vec![CommittedMessage {
                replica: 3,
                payload: b"hello".to_vec()
            }]
        );
    }

    #[test]
    fn abort_discards() {
        let broker = MemoryBroker::new();
        let client = broker.connect(0).unwrap();
        let mut tx = client.begin().unwrap();
        tx.producer(&dest("a")).unwrap().send(b"x").unwrap();
        tx.abort();
        assert!(broker.committed(&dest("a")).is_empty());
        assert_eq!(broker.stats().aborts, 1);
    }

    #[test]
    fn failed_commit_discards() {
        let broker = MemoryBroker::new();
        broker.fail_commit(1);
        let client = broker.connect(0).unwrap();

        let mut tx = client.begin().unwrap();
        tx.producer(&dest("a")).unwrap().send(b"x").unwrap();
        assert!(matches!(tx.commit(), Err(TransmissionError::Commit(_))));
        assert!(broker.committed(&dest("a")).is_empty());

        let mut tx = client.begin().unwrap();
        tx.producer(&dest("a")).unwrap().send(b"y").unwrap();
        tx.commit().unwrap();
        let committed = broker.committed(&dest("a"));
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].payload, b"y");
    }

    #[test]
    fn injected_faults_are_consumed() {
        let broker = MemoryBroker::new();
        broker.fail_connect(1);
        assert!(broker.connect(0).is_err());
        let client = broker.connect(0).unwrap();

        broker.fail_begin(1);
        assert!(client.begin().is_err());
        let mut tx = client.begin().unwrap();

        broker.fail_producer(1);
        assert!(tx.producer(&dest("a")).is_err());
        let mut producer = tx.producer(&dest("a")).unwrap();

        broker.fail_send("a", 1);
        assert!(producer.send(b"x").is_err());
        producer.send(b"x").unwrap();
        drop(producer);
        tx.commit().unwrap();

        let stats = broker.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.producers, 1);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.commits, 1);
    }
}
