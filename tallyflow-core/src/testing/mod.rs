use indexmap::IndexMap;

use crate::{
    config::StageConfig,
    flush::{decode_snapshot, SnapshotMessage},
    messaging::{EgressDestination, MemoryBroker},
    runtime::Job,
};

/// A record with an optional grouping key, like a word out of a tokenized sentence
#[derive(Debug, Clone)]
pub(crate) struct Word {
    pub word: Option<String>,
}

impl Word {
    pub(crate) fn new(word: &str) -> Self {
        Self {
            word: Some(word.to_string()),
        }
    }

    pub(crate) fn many(words: &[&str]) -> Vec<Self> {
        words.iter().map(|w| Self::new(w)).collect()
    }
}

/// A job counting [Word]s on the given broker
pub(crate) fn word_job(config: StageConfig, broker: MemoryBroker) -> Job<MemoryBroker, Word, String> {
    Job::new(config, broker, |w: &Word| w.word.clone())
}

/// Sum of all counts committed to a destination
pub(crate) fn committed_counts(
    broker: &MemoryBroker,
    destination: &EgressDestination,
) -> IndexMap<String, u64> {
    let mut merged = IndexMap::new();
    for msg in broker.committed(destination) {
        let snapshot: SnapshotMessage<String, u64> = decode_snapshot(&msg.payload).unwrap();
        assert_eq!(snapshot.replica, msg.replica);
        for (k, v) in snapshot.counts {
            *merged.entry(k).or_insert(0) += v;
        }
    }
    merged
}

/// Log to the test output. Safe to call from multiple tests.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
