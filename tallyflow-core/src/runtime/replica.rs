use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    flush::{FlushCoordinator, FlushResult},
    messaging::{EgressDestination, Messaging, MessagingClient, TransmissionError},
    operators::{CountLogic, Emitted, LocalAggregator, StatefulLogic, TailDetector},
    types::{Batch, Key, Message, ReplicaId},
};

/// Lifecycle of a replica.
///
/// `Created → Accumulating → Flushing → Flushed`. `Accumulating` repeats for every
/// non-final batch, `Flushing` repeats for every failed flush. `Flushed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// No batch received yet
    Created,
    /// Receiving records
    Accumulating,
    /// The end of the input was observed, the state is waiting to be flushed
    Flushing,
    /// The state was committed to every destination
    Flushed,
}

/// Resources a replica holds for its whole lifetime: its private state and
/// its client on the messaging substrate.
pub struct ReplicaResources<C, K, V, S = u64, L = CountLogic> {
    /// Private aggregation state
    pub aggregator: LocalAggregator<K, V, S, L>,
    /// Client on the messaging substrate
    pub client: C,
}

impl<C, K, V> ReplicaResources<C, K, V>
where
    C: MessagingClient,
    K: Key,
{
    /// Request the resources of a counting replica
    pub fn counting<M: Messaging<Client = C>>(
        messaging: &M,
        replica: ReplicaId,
    ) -> Result<Self, TransmissionError> {
        Ok(Self {
            aggregator: LocalAggregator::counting(),
            client: messaging.connect(replica)?,
        })
    }
}

/// One parallel instance of the aggregation stage.
///
/// A replica applies the batches delivered to it, detects the end of its input and then
/// flushes its state exactly once. It never shares its state with other replicas and
/// is driven by a single thread.
pub struct Replica<C, K: Key, V, S = u64, L = CountLogic> {
    id: ReplicaId,
    state: ReplicaState,
    aggregator: LocalAggregator<K, V, S, L>,
    tail: TailDetector,
    coordinator: FlushCoordinator<C, K, S>,
}

impl<C, K, V, S, L> Replica<C, K, V, S, L>
where
    C: MessagingClient,
    K: Key + Serialize,
    S: Default + Clone + Serialize,
    L: StatefulLogic<K, V, S>,
{
    /// Create a replica from the resources it was given at startup
    pub fn new(
        id: ReplicaId,
        resources: ReplicaResources<C, K, V, S, L>,
        destinations: Vec<EgressDestination>,
    ) -> Self {
        Self {
            id,
            state: ReplicaState::Created,
            aggregator: resources.aggregator,
            tail: TailDetector::default(),
            coordinator: FlushCoordinator::new(id, resources.client, destinations),
        }
    }

    /// Apply one batch. Never emits anything, all output happens on flush.
    ///
    /// Records arriving after the end of the input are rejected, accumulation is
    /// never reopened. A rejected batch has no effect at all, not even its end marker.
    pub fn on_batch(&mut self, batch: Batch<K, V>) -> Result<Emitted<K, S>, ReplicaError> {
        // reject the whole batch before any of it takes effect
        let mut ended = !matches!(self.state, ReplicaState::Created | ReplicaState::Accumulating);
        for msg in batch.iter() {
            match msg {
                Message::Data(_) if ended => {
                    return Err(ReplicaError::LateRecord { replica: self.id })
                }
                Message::Data(_) => (),
                Message::StreamEnd => ended = true,
            }
        }

        let is_final = self.tail.observe(&batch);
        if self.state == ReplicaState::Created {
            debug!(replica = self.id, "Accumulating");
            self.state = ReplicaState::Accumulating;
        }
        for msg in batch {
            if let Message::Data(d) = msg {
                self.aggregator.apply(d);
            }
        }
        if is_final {
            self.begin_flushing();
        }
        Ok(Vec::new())
    }

    /// The input closed without further batches
    pub fn on_closed(&mut self) {
        if self.tail.observe_closed() {
            self.begin_flushing();
        }
    }

    fn begin_flushing(&mut self) {
        info!(
            replica = self.id,
            keys = self.aggregator.len(),
            "End of input, waiting for flush"
        );
        self.state = ReplicaState::Flushing;
    }

    /// Whether the last observed batch was the final one
    pub fn is_final_batch(&self) -> bool {
        self.tail.is_final_batch()
    }

    /// Flush the state to every destination.
    ///
    /// May be called any number of times once the end of the input was observed.
    /// Only the first successful call transmits, all later calls return the same result.
    pub fn flush(&mut self) -> Result<FlushResult<K, S>, ReplicaError> {
        if !matches!(self.state, ReplicaState::Flushing | ReplicaState::Flushed) {
            return Err(ReplicaError::TailNotObserved { replica: self.id });
        }
        let result = self.coordinator.flush(self.aggregator.state())?.clone();
        if self.state != ReplicaState::Flushed {
            debug!(replica = self.id, "Flushed");
            self.state = ReplicaState::Flushed;
        }
        Ok(result)
    }

    /// Id of this replica
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReplicaState {
        self.state
    }

    /// Accumulated state so far
    pub fn counts(&self) -> &IndexMap<K, S> {
        self.aggregator.state()
    }
}

/// Errors raised by a replica
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A record arrived after the end of the input
    #[error("Replica {replica} received a record after the end of its input")]
    LateRecord {
        /// Receiving replica
        replica: ReplicaId,
    },
    /// Flush was requested before the end of the input
    #[error("Replica {replica} can not flush before the end of its input")]
    TailNotObserved {
        /// Flushing replica
        replica: ReplicaId,
    },
    /// Transmitting the flush failed
    #[error(transparent)]
    Transmission(#[from] TransmissionError),
}

impl ReplicaError {
    /// Whether the failed operation may be re-run
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicaError::Transmission(e) => e.is_retryable(),
            _ => false,
        }
    }
}
