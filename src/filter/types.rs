//! Filter capability shared by all transaction filters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::stream::{SourceId, TransactionEvent};

/// Processed/matched counters owned by each filter
#[derive(Debug, Default)]
pub struct FilterCounters {
    processed: AtomicU64,
    matched: AtomicU64,
}

impl FilterCounters {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_match(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-filter view exposed through the registry
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FilterStats {
    pub hits: u64,
    pub processed: u64,
    pub matched: u64,
}

/// Matching logic over a single transaction
pub trait TransactionFilter: Send + Sync {
    fn name(&self) -> &str;

    fn counters(&self) -> &FilterCounters;

    /// Classify one transaction, recording any match internally
    fn evaluate(&self, source_id: &SourceId, tx: &TransactionEvent) -> Result<bool>;

    /// Apply a JSON document of settings; unknown keys are ignored
    fn update_config(&self, json: &str) -> Result<()>;

    /// Evaluate and count; `processed` covers every call, including ones
    /// where `evaluate` errors or panics
    fn process_transaction(&self, source_id: &SourceId, tx: &TransactionEvent) -> Result<bool> {
        self.counters().record_processed();
        let matched = self.evaluate(source_id, tx)?;
        if matched {
            self.counters().record_match();
        }
        Ok(matched)
    }
}
