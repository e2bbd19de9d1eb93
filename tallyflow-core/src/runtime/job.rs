use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use backon::BlockingRetryable;
use futures::stream::FuturesUnordered;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, StageConfig},
    errorhandling::TallyFatal,
    flush::FlushResult,
    keyed::{partitioners::hash_select, partitioners::Partitioner, KeyFunc, KeyPartitioner, PartitionError},
    messaging::{Messaging, MessagingClient, TransmissionError},
    types::{Batch, Data, Key, Message, ReplicaId},
};

use super::{
    failfast::{FailFast, TaskFailure},
    replica::{Replica, ReplicaError, ReplicaResources},
};

/// Maximum number of batches buffered between the dispatcher and a replica
const CHANNEL_CAPACITY: usize = 64;

/// Runs a counting stage over a bounded input.
///
/// The job validates its config and every record's grouping key before anything is
/// dispatched. It then spreads the records over `replica_count` replicas, each running on
/// its own thread, and delivers them in batches of at most `batch_size` records.
/// The final batch of every replica carries the stream end marker, after which the replica
/// flushes its counts to every egress destination.
///
/// The job only succeeds if every replica flushed. The first replica failing aborts the job,
/// replicas which did not flush yet are cancelled.
///
/// # Example
/// ```rust
/// use tallyflow::config::StageConfig;
/// use tallyflow::messaging::MemoryBroker;
/// use tallyflow::runtime::Job;
///
/// let config = StageConfig::builder()
///     .replica_count(2)
///     .egress_destinations(vec!["counts".into()])
///     .build();
/// let words = ["a", "b", "a", "a"].map(String::from);
///
/// let report = Job::new(config, MemoryBroker::new(), |w: &String| Some(w.clone()))
///     .execute(words)
///     .unwrap();
/// let counts = report.merged_counts();
/// assert_eq!(counts["a"], 3);
/// assert_eq!(counts["b"], 1);
/// ```
pub struct Job<M, R, K> {
    config: StageConfig,
    messaging: Arc<M>,
    key_func: KeyFunc<R, K>,
    partitioner: Partitioner<K>,
}

impl<M, R, K> Job<M, R, K>
where
    M: Messaging,
    R: Data,
    K: Key + Serialize,
{
    /// Create a new job. `key_func` extracts the grouping key of a record,
    /// records are partitioned with [hash_select] unless configured otherwise.
    pub fn new(
        config: StageConfig,
        messaging: M,
        key_func: impl Fn(&R) -> Option<K> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            messaging: Arc::new(messaging),
            key_func: Box::new(key_func),
            partitioner: hash_select,
        }
    }

    /// Use a different partitioning function
    pub fn with_partitioner(mut self, partitioner: Partitioner<K>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Run the job to completion on a new async runtime
    pub fn execute(self, input: impl IntoIterator<Item = R>) -> Result<JobReport<K>, JobError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.run(input))
    }

    /// Run the job to completion on the current async runtime
    pub async fn run(self, input: impl IntoIterator<Item = R>) -> Result<JobReport<K>, JobError> {
        let Job {
            config,
            messaging,
            key_func,
            partitioner,
        } = self;
        config.validate()?;
        let records: Vec<R> = input.into_iter().collect();
        let partitioner = KeyPartitioner::new(key_func, partitioner, config.replica_count);
        partitioner.validate(&records)?;
        info!(
            replicas = config.replica_count,
            records = records.len(),
            "Starting job"
        );

        let config = Arc::new(config);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::new();
        let replicas = FuturesUnordered::new();
        for id in 0..config.replica_count {
            let (tx, rx) = flume::bounded(CHANNEL_CAPACITY);
            senders.push(tx);
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            let messaging = Arc::clone(&messaging);
            let config = Arc::clone(&config);
            let replica_cancelled = Arc::clone(&cancelled);
            let spawned = std::thread::Builder::new()
                .name(format!("tallyflow-replica-{id}"))
                .spawn(move || {
                    let result =
                        run_replica(id, messaging.as_ref(), &config, rx, &replica_cancelled);
                    // the job may have stopped waiting already
                    let _ = done_tx.send(result);
                });
            if let Err(e) = spawned {
                // replicas spawned so far see the flag once `senders` is dropped
                cancelled.store(true, Ordering::SeqCst);
                tracing::error!("Failed to spawn replica {id}: {e}");
                return Err(JobError::Spawn(e));
            }
            // a replica thread which panicked drops its sender without a result
            replicas.push(tokio::spawn(async move {
                done_rx
                    .await
                    .unwrap_or_else(|_| Err(JobError::ReplicaPanicked(id)))
            }));
        }

        let batch_size = config.batch_size;
        let dispatch_cancelled = Arc::clone(&cancelled);
        let dispatcher = tokio::task::spawn_blocking(move || {
            dispatch(records, &partitioner, senders, batch_size, &dispatch_cancelled)
        });

        let results = match replicas.failfast().await {
            Ok(x) => x,
            Err(failure) => {
                cancelled.store(true, Ordering::SeqCst);
                let err = match failure {
                    TaskFailure::Failed(e) => e,
                    TaskFailure::Panicked(e) => JobError::TaskPanicked(e),
                };
                tracing::error!("Job failed: {err}");
                return Err(err);
            }
        };
        dispatcher.await.map_err(JobError::TaskPanicked)?;

        info!("All {} replicas flushed", results.len());
        Ok(JobReport {
            results: results
                .into_iter()
                .sorted_by_key(|x| x.replica)
                .map(|x| (x.replica, x))
                .collect(),
        })
    }
}

/// Sets the cancellation flag when dropped while still armed,
/// i.e. when the dispatcher unwinds before completing.
struct CancelOnDrop<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}
impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Route all records to their replicas in batches, ending every replica's input
/// with a stream end marker.
fn dispatch<R, K>(
    records: Vec<R>,
    partitioner: &KeyPartitioner<R, K>,
    senders: Vec<flume::Sender<Batch<K, R>>>,
    batch_size: usize,
    cancelled: &AtomicBool,
) where
    R: Data,
    K: Key,
{
    // dropped before the senders, so replicas see the flag once their input disconnects
    let mut guard = CancelOnDrop {
        flag: cancelled,
        armed: true,
    };
    // batch_size is only an upper bound, buffers grow as records arrive
    let mut buffers: Vec<Batch<K, R>> = senders.iter().map(|_| Vec::new()).collect();

    for record in records {
        if cancelled.load(Ordering::SeqCst) {
            debug!("Job cancelled, stopping dispatch");
            return;
        }
        let (replica, msg) = partitioner
            .partition(record)
            .map_err(DispatchError::Partition)
            .tally_fatal();
        let idx = replica as usize;
        let buffer = buffers
            .get_mut(idx)
            .ok_or(DispatchError::ReplicaOutOfRange(replica))
            .tally_fatal();
        buffer.push(Message::Data(msg));
        if buffer.len() >= batch_size {
            let batch = std::mem::take(buffer);
            if senders[idx].send(batch).is_err() {
                warn!(replica, "Replica stopped receiving, stopping dispatch");
                return;
            }
        }
    }

    for (replica, (mut batch, sender)) in buffers.into_iter().zip(senders.iter()).enumerate() {
        batch.push(Message::StreamEnd);
        if sender.send(batch).is_err() {
            warn!(replica, "Replica stopped receiving, stopping dispatch");
            return;
        }
    }
    guard.armed = false;
    debug!("Dispatched all records");
}

fn run_replica<M, R, K>(
    id: ReplicaId,
    messaging: &M,
    config: &StageConfig,
    input: flume::Receiver<Batch<K, R>>,
    cancelled: &AtomicBool,
) -> Result<FlushResult<K>, JobError>
where
    M: Messaging,
    R: Data,
    K: Key + Serialize,
{
    let span = tracing::debug_span!("replica", replica_id = id);
    let _span_guard = span.enter();
    let replica_err = |source: ReplicaError| JobError::Replica { replica: id, source };

    let resources = (|| ReplicaResources::counting(messaging, id))
        .retry(config.flush_retry())
        .sleep(std::thread::sleep)
        .when(TransmissionError::is_retryable)
        .notify(|e, dur| warn!("Failed to connect to messaging: {e}. Retrying in {dur:?}"))
        .call()
        .map_err(|e| replica_err(e.into()))?;
    let mut replica: Replica<M::Client, K, R> =
        Replica::new(id, resources, config.egress_destinations.clone());

    loop {
        match input.recv() {
            Ok(batch) => {
                replica.on_batch(batch).map_err(replica_err)?;
                if replica.is_final_batch() {
                    break;
                }
            }
            Err(flume::RecvError::Disconnected) => {
                if cancelled.load(Ordering::SeqCst) {
                    return Err(JobError::Cancelled(id));
                }
                replica.on_closed();
                break;
            }
        }
    }
    if cancelled.load(Ordering::SeqCst) {
        return Err(JobError::Cancelled(id));
    }
    teardown(&mut replica, config).map_err(replica_err)
}

/// Runs on the final batch only: flush, re-running the whole transmission
/// while it fails with a retryable error.
fn teardown<C, K, R>(
    replica: &mut Replica<C, K, R>,
    config: &StageConfig,
) -> Result<FlushResult<K>, ReplicaError>
where
    C: MessagingClient,
    K: Key + Serialize,
{
    (|| replica.flush())
        .retry(config.flush_retry())
        .sleep(std::thread::sleep)
        .when(ReplicaError::is_retryable)
        .notify(|e, dur| warn!("Flush failed: {e}. Retrying in {dur:?}"))
        .call()
}

/// Flush results of a job where every replica flushed
#[derive(Debug, Clone)]
pub struct JobReport<K: Hash + Eq> {
    results: IndexMap<ReplicaId, FlushResult<K>>,
}

impl<K: Key> JobReport<K> {
    /// All flush results by replica
    pub fn results(&self) -> &IndexMap<ReplicaId, FlushResult<K>> {
        &self.results
    }

    /// Flush result of a single replica
    pub fn result(&self, replica: ReplicaId) -> Option<&FlushResult<K>> {
        self.results.get(&replica)
    }

    /// Union of all replicas' flushed counts
    pub fn merged_counts(&self) -> IndexMap<K, u64> {
        let mut merged = IndexMap::new();
        for (k, v) in self.results.values().flat_map(|x| x.snapshot.iter()) {
            *merged.entry(k.clone()).or_insert(0) += v;
        }
        merged
    }
}

/// Errors which fail a job
#[derive(Debug, Error)]
pub enum JobError {
    /// The stage config is invalid
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    /// A record has no grouping key
    #[error("Invalid input")]
    Partition(#[from] PartitionError),
    /// A replica failed
    #[error("Replica {replica} failed")]
    Replica {
        /// Failed replica
        replica: ReplicaId,
        /// Cause of the failure
        #[source]
        source: ReplicaError,
    },
    /// A replica stopped because another part of the job failed
    #[error("Replica {0} was cancelled")]
    Cancelled(ReplicaId),
    /// A replica panicked, e.g. due to a fatal error
    #[error("Replica {0} panicked")]
    ReplicaPanicked(ReplicaId),
    /// The dispatcher or another job task panicked
    #[error("Task panicked: {0}")]
    TaskPanicked(#[source] tokio::task::JoinError),
    /// A replica thread could not be started
    #[error("Error spawning replica thread: {0:?}")]
    Spawn(#[source] std::io::Error),
    /// The async runtime could not be started
    #[error("Error starting async runtime: {0:?}")]
    AsyncRuntime(#[from] std::io::Error),
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("Record passed validation but could not be partitioned")]
    Partition(#[source] PartitionError),
    #[error("Partitioner selected replica {0} which does not exist")]
    ReplicaOutOfRange(ReplicaId),
}
