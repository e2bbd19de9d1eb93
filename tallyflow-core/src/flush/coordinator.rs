use std::hash::Hash;

use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    messaging::{EgressDestination, EgressProducer, MessagingClient, Transaction, TransmissionError},
    types::{Key, ReplicaId},
};

use super::once::FlushOnce;

/// The message every egress destination receives from a replica: the complete
/// key to count mapping, never a stream of deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMessage<K: Hash + Eq, S> {
    /// Replica which produced the snapshot
    pub replica: ReplicaId,
    /// Final state, in order of first appearance of each key
    pub counts: IndexMap<K, S>,
}

#[derive(Serialize)]
struct SnapshotMessageRef<'a, K, S> {
    replica: ReplicaId,
    counts: &'a IndexMap<K, S>,
}

/// Encode a snapshot into the payload sent downstream (MessagePack)
pub fn encode_snapshot<K: Serialize, S: Serialize>(
    replica: ReplicaId,
    counts: &IndexMap<K, S>,
) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(&SnapshotMessageRef { replica, counts })
}

/// Decode a payload sent by a replica's flush
pub fn decode_snapshot<K, S>(payload: &[u8]) -> Result<SnapshotMessage<K, S>, rmp_serde::decode::Error>
where
    K: DeserializeOwned + Hash + Eq,
    S: DeserializeOwned,
{
    rmp_serde::from_slice(payload)
}

/// Outcome of a successful flush. Written exactly once per replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResult<K: Hash + Eq, S = u64> {
    /// Replica which flushed
    pub replica: ReplicaId,
    /// The state which was transmitted
    pub snapshot: IndexMap<K, S>,
    /// Encoded message every destination received
    pub payload: Vec<u8>,
    /// Destinations the message was committed to
    pub destinations: Vec<EgressDestination>,
    /// Attempt which committed, starting at 1
    pub attempt: u32,
}

/// Transmits a replica's final state exactly once.
///
/// [FlushCoordinator::flush] may be called any number of times, from any number of threads.
/// The first call snapshots the state and runs the transmission: begin a transaction,
/// send the snapshot through one producer per destination, commit. Until a commit succeeds
/// every call re-runs the whole transmission, a failed attempt is aborted and leaves nothing
/// behind. After the commit every call returns the memoized result without touching the
/// messaging substrate again.
pub struct FlushCoordinator<C, K: Hash + Eq, S = u64> {
    replica: ReplicaId,
    client: C,
    destinations: Vec<EgressDestination>,
    result: FlushOnce<FlushResult<K, S>>,
}

impl<C, K, S> FlushCoordinator<C, K, S>
where
    C: MessagingClient,
    K: Key + Serialize,
    S: Clone + Serialize,
{
    /// Create a coordinator delivering to `destinations` through `client`
    pub fn new(replica: ReplicaId, client: C, destinations: Vec<EgressDestination>) -> Self {
        Self {
            replica,
            client,
            destinations,
            result: FlushOnce::new(),
        }
    }

    /// Flush `state` to every destination, or return the result of the flush which
    /// already committed.
    pub fn flush(&self, state: &IndexMap<K, S>) -> Result<&FlushResult<K, S>, TransmissionError> {
        if let Some(done) = self.result.get() {
            debug!(replica = self.replica, "Flush already committed, returning memoized result");
            return Ok(done);
        }
        self.result
            .get_or_try_init(|attempt| self.transmit(state, attempt))
    }

    /// The committed result, if any
    pub fn result(&self) -> Option<&FlushResult<K, S>> {
        self.result.get()
    }

    /// Number of transmissions started so far
    pub fn attempts(&self) -> u32 {
        self.result.attempts()
    }

    /// Destinations this coordinator delivers to
    pub fn destinations(&self) -> &[EgressDestination] {
        &self.destinations
    }

    fn transmit(
        &self,
        state: &IndexMap<K, S>,
        attempt: u32,
    ) -> Result<FlushResult<K, S>, TransmissionError> {
        let span = tracing::debug_span!("flush", replica = self.replica, attempt);
        let _span_guard = span.enter();

        let snapshot = state.clone();
        let payload = encode_snapshot(self.replica, &snapshot)?;
        debug!(keys = snapshot.len(), bytes = payload.len(), "Starting transmission");

        let mut transaction = self.client.begin()?;
        for destination in self.destinations.iter() {
            // the producer is released at the end of every iteration
            let sent = transaction
                .producer(destination)
                .and_then(|mut producer| producer.send(&payload));
            if let Err(e) = sent {
                warn!("Aborting flush transaction: {e}");
                transaction.abort();
                return Err(e);
            }
        }
        transaction.commit()?;
        info!(
            destinations = self.destinations.len(),
            "Committed flush of {} keys",
            snapshot.len()
        );

        Ok(FlushResult {
            replica: self.replica,
            snapshot,
            payload,
            destinations: self.destinations.clone(),
            attempt,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::messaging::{MemoryBroker, Messaging};

    use super::*;

    fn destinations() -> Vec<EgressDestination> {
        vec!["first".into(), "second".into()]
    }

    fn state() -> IndexMap<String, u64> {
        IndexMap::from([("a".to_string(), 3), ("b".to_string(), 1)])
    }

    fn coordinator(broker: &MemoryBroker) -> FlushCoordinator<crate::messaging::memory::MemoryClient, String> {
        FlushCoordinator::new(0, broker.connect(0).unwrap(), destinations())
    }

    #[test]
    fn delivers_to_every_destination() {
        let broker = MemoryBroker::new();
        let coord = coordinator(&broker);
        let result = coord.flush(&state()).unwrap();
        assert_eq!(result.snapshot, state());
        assert_eq!(result.attempt, 1);

        for dest in destinations() {
            let committed = broker.committed(&dest);
            assert_eq!(committed.len(), 1);
            let msg: SnapshotMessage<String, u64> = decode_snapshot(&committed[0].payload).unwrap();
            assert_eq!(msg.counts, state());
            assert_eq!(msg.replica, 0);
        }
    }

    #[test]
    fn repeated_flush_is_idempotent() {
        let broker = MemoryBroker::new();
        let coord = coordinator(&broker);
        let first = coord.flush(&state()).unwrap().clone();
        let stats = broker.stats();
        for _ in 0..5 {
            assert_eq!(*coord.flush(&state()).unwrap(), first);
        }
        // no new transactions, producers or messages
        assert_eq!(broker.stats(), stats);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(coord.attempts(), 1);
    }

    /// the memoized snapshot does not change even if a different state is passed later
    #[test]
    fn memoized_result_is_stable() {
        let broker = MemoryBroker::new();
        let coord = coordinator(&broker);
        coord.flush(&state()).unwrap();
        let other = IndexMap::from([("z".to_string(), 9)]);
        assert_eq!(coord.flush(&other).unwrap().snapshot, state());
    }

    #[test]
    fn commit_failure_is_retried_in_full() {
        let broker = MemoryBroker::new();
        broker.fail_commit(1);
        let coord = coordinator(&broker);

        let err = coord.flush(&state()).unwrap_err();
        assert!(err.is_retryable());
        assert!(coord.result().is_none());
        for dest in destinations() {
            assert!(broker.committed(&dest).is_empty());
        }

        let result = coord.flush(&state()).unwrap();
        assert_eq!(result.attempt, 2);
        for dest in destinations() {
            assert_eq!(broker.committed(&dest).len(), 1);
        }
        let stats = broker.stats();
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.messages_sent, 4);
        assert_eq!(stats.commits, 1);
    }

    /// a send failing after the first destination must not commit anything
    #[test]
    fn send_failure_is_atomic() {
        let broker = MemoryBroker::new();
        broker.fail_send("second", 1);
        let coord = coordinator(&broker);

        assert!(matches!(
            coord.flush(&state()),
            Err(TransmissionError::Send(_, _))
        ));
        for dest in destinations() {
            assert!(broker.committed(&dest).is_empty());
        }
        assert_eq!(broker.stats().aborts, 1);
        assert_eq!(broker.stats().commits, 0);

        coord.flush(&state()).unwrap();
        for dest in destinations() {
            assert_eq!(broker.committed(&dest).len(), 1);
        }
    }

    #[test]
    fn session_and_producer_failures_are_retryable() {
        let broker = MemoryBroker::new();
        broker.fail_begin(1);
        broker.fail_producer(1);
        let coord = coordinator(&broker);

        assert!(matches!(coord.flush(&state()), Err(TransmissionError::Begin(_))));
        assert!(matches!(
            coord.flush(&state()),
            Err(TransmissionError::CreateProducer(_, _))
        ));
        assert_eq!(coord.flush(&state()).unwrap().attempt, 3);
        assert_eq!(broker.committed(&"first".into()).len(), 1);
    }

    /// concurrent flush triggers result in a single transmission
    #[test]
    fn concurrent_flushes_transmit_once() {
        let broker = MemoryBroker::new();
        let coord = Arc::new(coordinator(&broker));
        let state = state();
        std::thread::scope(|s| {
            for _ in 0..8 {
                let coord = Arc::clone(&coord);
                let state = &state;
                s.spawn(move || {
                    coord.flush(state).unwrap();
                });
            }
        });
        assert_eq!(broker.stats().commits, 1);
        assert_eq!(broker.committed(&"second".into()).len(), 1);
    }

    #[test]
    fn no_destinations_commits_empty_transaction() {
        let broker = MemoryBroker::new();
        let coord: FlushCoordinator<_, String> =
            FlushCoordinator::new(1, broker.connect(1).unwrap(), Vec::new());
        coord.flush(&state()).unwrap();
        assert_eq!(broker.stats().commits, 1);
        assert_eq!(broker.stats().messages_sent, 0);
    }
}
