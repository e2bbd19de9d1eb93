use thiserror::Error;

use crate::types::{DataMessage, Key, ReplicaId};

use super::partitioners::Partitioner;

/// Extracts the grouping key of a record. Returning `None` means the record has no key,
/// which is a configuration error.
pub type KeyFunc<R, K> = Box<dyn Fn(&R) -> Option<K> + Send + Sync>;

/// Routes every record to exactly one aggregator replica.
///
/// Routing is a pure function of the grouping key, so all records sharing a key
/// reach the same replica, even under redelivery.
pub struct KeyPartitioner<R, K> {
    key_func: KeyFunc<R, K>,
    partitioner: Partitioner<K>,
    replica_count: u64,
}

impl<R, K> KeyPartitioner<R, K>
where
    K: Key,
{
    /// Create a new partitioner.
    /// `replica_count` must be the same count the job spawns replicas for.
    pub fn new(
        key_func: impl Fn(&R) -> Option<K> + Send + Sync + 'static,
        partitioner: Partitioner<K>,
        replica_count: u64,
    ) -> Self {
        Self {
            key_func: Box::new(key_func),
            partitioner,
            replica_count,
        }
    }

    /// Number of replicas records are spread over
    pub fn replica_count(&self) -> u64 {
        self.replica_count
    }

    /// Select the replica responsible for a key
    pub fn assign(&self, key: &K) -> ReplicaId {
        (self.partitioner)(key, self.replica_count)
    }

    /// Select the replica responsible for a record
    pub fn route(&self, record: &R) -> Result<ReplicaId, PartitionError> {
        let key = (self.key_func)(record).ok_or(PartitionError::MissingKey { index: None })?;
        Ok(self.assign(&key))
    }

    /// Extract the key of a record and select its replica
    pub fn partition(&self, record: R) -> Result<(ReplicaId, DataMessage<K, R>), PartitionError> {
        let key = (self.key_func)(&record).ok_or(PartitionError::MissingKey { index: None })?;
        let replica = self.assign(&key);
        Ok((replica, DataMessage::new(key, record)))
    }

    /// Check every record has a grouping key before the job starts.
    /// Fails on the first record without one.
    pub fn validate<'a>(
        &self,
        records: impl IntoIterator<Item = &'a R>,
    ) -> Result<(), PartitionError>
    where
        R: 'a,
    {
        for (i, record) in records.into_iter().enumerate() {
            if (self.key_func)(record).is_none() {
                return Err(PartitionError::MissingKey { index: Some(i) });
            }
        }
        Ok(())
    }
}

/// Errors in routing records to replicas
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    /// A record had no grouping key
    #[error("Record has no grouping key (position: {index:?})")]
    MissingKey {
        /// Position of the record in the input, if known
        index: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::keyed::partitioners::{hash_select, rendezvous_select};

    use super::*;

    #[derive(Debug, Clone)]
    struct Word {
        word: Option<String>,
        position: usize,
    }

    fn word_partitioner(n: u64) -> KeyPartitioner<Word, String> {
        KeyPartitioner::new(|w: &Word| w.word.clone(), hash_select, n)
    }

    #[test]
    fn rejects_missing_key() {
        let partitioner = word_partitioner(2);
        let records = vec![
            Word {
                word: Some("a".into()),
                position: 0,
            },
            Word {
                word: None,
                position: 1,
            },
        ];
        assert_eq!(
            partitioner.validate(&records),
            Err(PartitionError::MissingKey { index: Some(1) })
        );
        assert!(partitioner.route(&records[1]).is_err());
    }

    #[test]
    fn partition_keeps_record() {
        let partitioner = KeyPartitioner::new(|w: &Word| w.word.clone(), rendezvous_select, 4);
        let record = Word {
            word: Some("hello".into()),
            position: 7,
        };
        let (replica, msg) = partitioner.partition(record.clone()).unwrap();
        assert_eq!(replica, partitioner.route(&record).unwrap());
        assert_eq!(msg.key, "hello");
        assert_eq!(msg.value.position, 7);
    }

    proptest! {
        /// records with equal keys are routed identically, whatever their payload
        #[test]
        fn partition_affinity(word in "[a-z]{0,8}", p1 in 0usize..1000, p2 in 0usize..1000, n in 1u64..16) {
            let partitioner = word_partitioner(n);
            let r1 = Word { word: Some(word.clone()), position: p1 };
            let r2 = Word { word: Some(word), position: p2 };
            prop_assert_eq!(partitioner.route(&r1).unwrap(), partitioner.route(&r2).unwrap());
        }
    }
}
