//! tallyflow is a grouped, stateful counting stage for dataflow jobs.
//!
//! Records are partitioned by key over a number of replicas. Every replica counts its
//! records in private state and, once its input is exhausted, flushes the counts to every
//! egress destination exactly once, using a transactional handshake which is safe to retry.
pub mod config;
pub mod errorhandling;
pub mod flush;
pub mod keyed;
pub mod messaging;
pub mod operators;
pub mod runtime;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
