//! Per-worker batch buffer

use std::sync::Arc;

use super::event::TransactionEvent;

/// Ordered buffer of events awaiting flush
#[derive(Debug)]
pub struct Batch {
    threshold: usize,
    events: Vec<Arc<TransactionEvent>>,
}

impl Batch {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            events: Vec::with_capacity(threshold),
        }
    }

    /// Append an event; returns true once the flush threshold is reached
    pub fn push(&mut self, event: Arc<TransactionEvent>) -> bool {
        self.events.push(event);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.threshold
    }

    /// Drain everything, leaving the batch empty
    pub fn take(&mut self) -> Vec<Arc<TransactionEvent>> {
        std::mem::replace(&mut self.events, Vec::with_capacity(self.threshold))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sig: &str) -> Arc<TransactionEvent> {
        Arc::new(TransactionEvent {
            signature: sig.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_push_reports_threshold() {
        let mut batch = Batch::new(3);
        assert!(!batch.push(event("a")));
        assert!(!batch.push(event("b")));
        assert!(batch.push(event("c")));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_take_preserves_order_and_empties() {
        let mut batch = Batch::new(2);
        batch.push(event("first"));
        batch.push(event("second"));

        let drained = batch.take();
        assert!(batch.is_empty());
        assert_eq!(
            drained.iter().map(|e| e.signature.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let mut batch = Batch::new(0);
        assert_eq!(batch.threshold(), 1);
        assert!(batch.push(event("x")));
    }
}
