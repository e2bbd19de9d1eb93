//! Types and traits for data processed in tallyflow

/// Data which may move through a stream.
/// Records are handed between the dispatcher and replica threads, so they must be `Send`.
#[diagnostic::on_unimplemented(message = "Type must be `Clone + Send + 'static` to be used as data")]
pub trait Data: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> Data for T {}
