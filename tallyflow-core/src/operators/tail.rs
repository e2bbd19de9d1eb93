use tracing::debug;

use crate::types::Message;

/// Detects the final batch of a replica's input.
///
/// The detector is evaluated once per batch boundary. A batch is final if it carried the
/// first stream end marker, or if the input closed before any marker arrived.
/// Batch granularity does not matter: any number of batches, including empty ones, may
/// precede the final one.
#[derive(Debug, Default, Clone)]
pub struct TailDetector {
    batches_seen: u64,
    tail_observed: bool,
    final_batch: bool,
}

impl TailDetector {
    /// Observe one batch, returning whether it is the final batch.
    pub fn observe<K, V>(&mut self, batch: &[Message<K, V>]) -> bool {
        self.batches_seen += 1;
        let has_end = batch.iter().any(Message::is_stream_end);
        self.boundary(has_end)
    }

    /// Observe that the input closed without any further batch.
    /// This counts as the final batch, unless the tail was already observed.
    pub fn observe_closed(&mut self) -> bool {
        self.boundary(true)
    }

    fn boundary(&mut self, has_end: bool) -> bool {
        if has_end && !self.tail_observed {
            debug!(batch = self.batches_seen, "Observed stream end");
            self.tail_observed = true;
            self.final_batch = true;
        } else {
            if has_end {
                debug!("Ignoring repeated stream end");
            }
            self.final_batch = false;
        }
        self.final_batch
    }

    /// True exactly for the batch in which the end of the stream was observed
    pub fn is_final_batch(&self) -> bool {
        self.final_batch
    }

    /// True once the end of the stream was observed in any batch
    pub fn tail_observed(&self) -> bool {
        self.tail_observed
    }

    /// Number of batches observed, not counting input closure
    pub fn batches_seen(&self) -> u64 {
        self.batches_seen
    }
}
