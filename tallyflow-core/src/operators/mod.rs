//! Operators applied by a replica to its share of the stream
mod aggregate;
mod tail;

pub use aggregate::{AggregateError, CountLogic, Emitted, LocalAggregator, StatefulLogic};
pub use tail::TailDetector;
