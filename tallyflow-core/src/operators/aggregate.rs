use std::marker::PhantomData;

use indexmap::{IndexMap, TryReserveError};
use thiserror::Error;

use crate::{
    errorhandling::TallyFatal,
    types::{DataMessage, Key},
};

/// Per-key logic of a [LocalAggregator].
pub trait StatefulLogic<K, V, S>: Send + 'static {
    /// Return Some to retain the key-state and None to discard it
    fn on_data(&mut self, msg: DataMessage<K, V>, key_state: S) -> Option<S>;
}
impl<X, K, V, S> StatefulLogic<K, V, S> for X
where
    X: FnMut(DataMessage<K, V>, S) -> Option<S> + Send + 'static,
{
    fn on_data(&mut self, msg: DataMessage<K, V>, key_state: S) -> Option<S> {
        self(msg, key_state)
    }
}

/// Counts records per key. A key seen for the first time starts at 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountLogic;

impl<K, V> StatefulLogic<K, V, u64> for CountLogic {
    fn on_data(&mut self, _msg: DataMessage<K, V>, key_state: u64) -> Option<u64> {
        Some(key_state.saturating_add(1))
    }
}

/// Records emitted by [LocalAggregator::apply]
pub type Emitted<K, S> = Vec<DataMessage<K, S>>;

/// Owns the private aggregation state of exactly one replica.
///
/// The aggregator never talks to other replicas and is only ever driven by a single
/// thread, so the state needs no locking. Output is deferred entirely to the flush,
/// [LocalAggregator::apply] never emits anything.
///
/// Duplicate deliveries of the same logical record are counted twice. Upstream must
/// deliver each record at most once for counts to be exact.
pub struct LocalAggregator<K, V, S = u64, L = CountLogic> {
    state: IndexMap<K, S>,
    logic: L,
    _phantom: PhantomData<fn(V)>,
}

impl<K, V> LocalAggregator<K, V>
where
    K: Key,
{
    /// A counting aggregator with empty state
    pub fn counting() -> Self {
        Self::new(CountLogic)
    }
}

impl<K, V, S, L> LocalAggregator<K, V, S, L>
where
    K: Key,
    S: Default,
    L: StatefulLogic<K, V, S>,
{
    /// Create a new aggregator with empty state
    pub fn new(logic: L) -> Self {
        Self {
            state: IndexMap::new(),
            logic,
            _phantom: PhantomData,
        }
    }

    /// Apply one record to the state.
    ///
    /// **PANIC:** if the state can not grow to hold a new key. Running out of memory
    /// is fatal to the replica.
    pub fn apply(&mut self, msg: DataMessage<K, V>) -> Emitted<K, S> {
        match self.state.get_index_of(&msg.key) {
            Some(idx) => {
                let key_state = std::mem::take(&mut self.state[idx]);
                match self.logic.on_data(msg, key_state) {
                    Some(new_state) => self.state[idx] = new_state,
                    None => {
                        self.state.shift_remove_index(idx);
                    }
                }
            }
            None => {
                self.state
                    .try_reserve(1)
                    .map_err(AggregateError::Grow)
                    .tally_fatal();
                let key = msg.key.clone();
                if let Some(new_state) = self.logic.on_data(msg, S::default()) {
                    self.state.insert(key, new_state);
                }
            }
        }
        Vec::new()
    }

    /// Current state, in order of first appearance of each key
    pub fn state(&self) -> &IndexMap<K, S> {
        &self.state
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> IndexMap<K, S>
    where
        S: Clone,
    {
        self.state.clone()
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// True if no key is held
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// Fatal aggregation errors
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The state map could not grow
    #[error("Failed to grow aggregation state")]
    Grow(#[source] TryReserveError),
}
