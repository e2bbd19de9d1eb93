//! The runtime drives replicas: it dispatches records to them, detects the end of their
//! input and runs their flush.
mod failfast;
mod job;
mod replica;

pub use job::{Job, JobError, JobReport};
pub use replica::{Replica, ReplicaError, ReplicaResources, ReplicaState};
