//! Owns the set of ingestion workers keyed by source id

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{IngestSettings, IngestionWorker, SourceSnapshot};
use crate::config::{DataSourceConfig, SourceKind};
use crate::pipeline::Pipeline;
use crate::stream::{GeyserConnector, SourceId};

pub struct SourceManager {
    workers: Mutex<HashMap<SourceId, IngestionWorker>>,
    connector: Arc<dyn GeyserConnector>,
    pipeline: Arc<Pipeline>,
    settings: Mutex<IngestSettings>,
    health: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SourceManager {
    pub fn new(
        connector: Arc<dyn GeyserConnector>,
        pipeline: Arc<Pipeline>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            connector,
            pipeline,
            settings: Mutex::new(settings),
            health: Mutex::new(None),
        }
    }

    /// Register and start a worker; must run inside a tokio runtime
    pub fn add_data_source(&self, address: &str, kind: SourceKind) -> SourceId {
        self.add_source(DataSourceConfig {
            address: address.to_string(),
            kind,
            x_token: None,
        })
    }

    pub fn add_source(&self, source: DataSourceConfig) -> SourceId {
        let id = SourceId::new();
        let worker = IngestionWorker::spawn(
            id,
            source,
            self.settings(),
            self.connector.clone(),
            self.pipeline.clone(),
        );
        self.lock_workers().insert(id, worker);
        id
    }

    /// Stop and forget a source; false when the id is unknown
    pub async fn remove_data_source(&self, id: SourceId) -> bool {
        let worker = self.lock_workers().remove(&id);
        match worker {
            Some(worker) => {
                worker.stop().await;
                info!(source_id = %id, "Data source removed");
                true
            }
            None => false,
        }
    }

    /// Applies to workers started after the call
    pub fn update_settings(&self, settings: IngestSettings) {
        *self.settings.lock().unwrap_or_else(|p| p.into_inner()) = settings;
    }

    fn settings(&self) -> IngestSettings {
        self.settings.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace every disconnected worker with a fresh one on the same source.
    /// Returns the ids of the replacements.
    pub async fn health_check(&self) -> Vec<SourceId> {
        let stale: Vec<IngestionWorker> = {
            let mut workers = self.lock_workers();
            let ids: Vec<SourceId> = workers
                .values()
                .filter(|w| w.needs_replacement())
                .map(|w| w.id())
                .collect();
            ids.iter().filter_map(|id| workers.remove(id)).collect()
        };

        let mut replaced = Vec::with_capacity(stale.len());
        for worker in stale {
            let old_id = worker.id();
            let source = worker.source().clone();
            if let Some(error) = worker.stats().last_error() {
                warn!(source_id = %old_id, address = %source.address, "Replacing disconnected source: {}", error);
            } else {
                warn!(source_id = %old_id, address = %source.address, "Replacing disconnected source");
            }
            worker.stop().await;
            let new_id = self.add_source(source);
            info!(old = %old_id, new = %new_id, "Data source reconnecting");
            replaced.push(new_id);
        }
        replaced
    }

    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let replaced = manager.health_check().await;
                        debug!(replaced = replaced.len(), "Health check complete");
                    }
                }
            }
        });

        let previous = self
            .health
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace((cancel, task));
        if let Some((cancel, _)) = previous {
            cancel.cancel();
        }
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.lock_workers().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_workers().is_empty()
    }

    pub fn stats(&self) -> Vec<SourceSnapshot> {
        let mut snapshots: Vec<_> = self.lock_workers().values().map(|w| w.snapshot()).collect();
        snapshots.sort_by(|a, b| a.address.cmp(&b.address).then(a.id.cmp(&b.id)));
        snapshots
    }

    /// Stop health checks, then every worker
    pub async fn shutdown(&self) {
        let health = self.health.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((cancel, task)) = health {
            cancel.cancel();
            let _ = task.await;
        }

        let workers: Vec<_> = self.lock_workers().drain().map(|(_, w)| w).collect();
        let count = workers.len();
        futures::future::join_all(workers.into_iter().map(|w| w.stop())).await;
        info!("Stopped {} data sources", count);
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<SourceId, IngestionWorker>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::harness;
    use crate::source::worker::tests::{settings, wait_until};
    use crate::source::worker::WorkerPhase;
    use crate::stream::call::mock::{tx, MockConnector, MockStep};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_add_and_remove() {
        let h = harness();
        let connector = MockConnector::with_calls(vec![vec![MockStep::Event(tx("m0"))]]);
        let manager = SourceManager::new(Arc::new(connector), h.pipeline.clone(), settings(5));

        let id = manager.add_data_source("http://127.0.0.1:10000", SourceKind::Geyser);
        assert_eq!(manager.len(), 1);
        wait_until("first event", || manager.stats()[0].total_transactions == 1).await;

        let stats = manager.stats();
        assert!(stats[0].connected);
        assert_eq!(stats[0].id, id);
        assert_eq!(stats[0].total_transactions, 1);

        assert!(manager.remove_data_source(id).await);
        assert!(!manager.remove_data_source(id).await);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_replaces_disconnected_source() {
        let h = harness();
        let connector = MockConnector::failing();
        let manager = SourceManager::new(Arc::new(connector.clone()), h.pipeline.clone(), settings(5));

        let id = manager.add_data_source("http://127.0.0.1:10001", SourceKind::Geyser);
        wait_until("disconnect", || manager.stats()[0].phase == WorkerPhase::Disconnected).await;

        let replaced = manager.health_check().await;
        assert_eq!(replaced.len(), 1);
        assert_ne!(replaced[0], id);
        assert_eq!(manager.source_ids(), replaced);
        assert_eq!(manager.stats()[0].address, "http://127.0.0.1:10001");
        wait_until("second connect", || connector.connects.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_health_check_keeps_streaming_sources() {
        let h = harness();
        let connector = MockConnector::with_calls(vec![vec![MockStep::Ping]]);
        let manager = SourceManager::new(Arc::new(connector), h.pipeline.clone(), settings(5));

        let id = manager.add_data_source("http://127.0.0.1:10002", SourceKind::Geyser);
        wait_until("stream", || manager.stats()[0].connected).await;

        assert!(manager.health_check().await.is_empty());
        assert_eq!(manager.source_ids(), vec![id]);
        manager.shutdown().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_periodic_health_checks() {
        let h = harness();
        let connector = MockConnector::failing();
        let manager = Arc::new(SourceManager::new(
            Arc::new(connector.clone()),
            h.pipeline.clone(),
            settings(5),
        ));
        manager.add_data_source("http://127.0.0.1:10003", SourceKind::Geyser);
        manager.start_health_checks(Duration::from_millis(20));

        wait_until("repeated reconnects", || connector.connects.load(Ordering::SeqCst) >= 3).await;
        manager.shutdown().await;
        assert!(manager.is_empty());
    }
}
