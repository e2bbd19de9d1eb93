//! Key types for grouped streams

use std::hash::Hash;

/// Marker trait for grouping keys.
///
/// Keys must hash deterministically: the same logical key must produce the same hash
/// in every process, otherwise partition affinity is lost on redelivery.
#[diagnostic::on_unimplemented(
    message = "Type must be `Hash + Eq + Clone + Send + 'static` to be used as a grouping key"
)]
pub trait Key: Hash + Eq + Clone + Send + std::fmt::Debug + 'static {}
impl<T: Hash + Eq + Clone + Send + std::fmt::Debug + 'static> Key for T {}
