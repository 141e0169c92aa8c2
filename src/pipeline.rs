//! Per-batch dispatch: filters, then storage, then notifications

use std::sync::Arc;
use tracing::debug;

use crate::filter::FilterRegistry;
use crate::notify::{DeliveryReceipt, NotificationDispatcher};
use crate::storage::{StorageEngine, StorageReceipt};
use crate::stream::{SourceId, TransactionEvent};

/// What a flush produced; receipts resolve as the background workers finish
pub struct FlushReport {
    pub transactions: usize,
    pub matched: usize,
    pub stored: StorageReceipt<usize>,
    pub deliveries: Vec<DeliveryReceipt>,
}

pub struct Pipeline {
    filters: Arc<FilterRegistry>,
    storage: Arc<StorageEngine>,
    notifier: Arc<NotificationDispatcher>,
}

impl Pipeline {
    pub fn new(
        filters: Arc<FilterRegistry>,
        storage: Arc<StorageEngine>,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            filters,
            storage,
            notifier,
        }
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn notifier(&self) -> &Arc<NotificationDispatcher> {
        &self.notifier
    }

    pub async fn flush(&self, source_id: SourceId, events: Vec<Arc<TransactionEvent>>) -> FlushReport {
        let matched = self.filters.process_batch(source_id, &events).await;

        let entries = events
            .iter()
            .map(|event| (event.storage_key(), event.payload.clone()))
            .collect();
        let stored = self.storage.store_batch(entries);

        let deliveries = self
            .notifier
            .send_batch_notifications(&format!("Processed {} transactions", events.len()));

        debug!(%source_id, transactions = events.len(), matched, "Batch flushed");

        FlushReport {
            transactions: events.len(),
            matched,
            stored,
            deliveries,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::StorageConfig;
    use crate::notify::testing::{fast_policy, FlakyPlugin};

    pub struct Harness {
        pub pipeline: Arc<Pipeline>,
        pub plugin: Arc<FlakyPlugin>,
        pub _dir: tempfile::TempDir,
    }

    /// Real storage in a temp dir, an always-matching dex-style filter set, one plugin
    pub fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageEngine::open(&StorageConfig {
            path: dir.path().join("db").to_string_lossy().into_owned(),
            block_cache_mb: 8,
            write_buffer_mb: 4,
            ..Default::default()
        })
        .unwrap();

        let filters = Arc::new(FilterRegistry::new(2));
        filters.add_filter(Arc::new(crate::filter::DexFilter::new(&Default::default())));

        let notifier = Arc::new(NotificationDispatcher::new(fast_policy(), true));
        let plugin = Arc::new(FlakyPlugin::new("recorder", 0));
        notifier.add_plugin(plugin.clone());

        Harness {
            pipeline: Arc::new(Pipeline::new(filters, Arc::new(storage), notifier)),
            plugin,
            _dir: dir,
        }
    }
}
