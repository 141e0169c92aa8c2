//! Named filter instances with bounded concurrent fan-out

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::types::{FilterStats, TransactionFilter};
use crate::config::default_half_cores;
use crate::error::{Error, Result};
use crate::stream::{SourceId, TransactionEvent};

struct Registration {
    filter: Arc<dyn TransactionFilter>,
    hits: Arc<AtomicU64>,
}

/// Permit that is retired instead of released while the bound has shrunk
/// below the number of permits in circulation
struct FilterPermit {
    permit: Option<OwnedSemaphorePermit>,
    debt: Arc<AtomicUsize>,
}

impl Drop for FilterPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if pay_debt(&self.debt) {
                permit.forget();
            }
        }
    }
}

async fn acquire_permit(permits: Arc<Semaphore>, debt: Arc<AtomicUsize>) -> Result<FilterPermit> {
    let permit = permits
        .acquire_owned()
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(FilterPermit {
        permit: Some(permit),
        debt,
    })
}

fn pay_debt(debt: &AtomicUsize) -> bool {
    debt.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
        .is_ok()
}

/// Owns the filters and dispatches every transaction to all of them
pub struct FilterRegistry {
    filters: Mutex<BTreeMap<String, Registration>>,
    permits: Arc<Semaphore>,
    /// Permits still to be retired after a shrink
    debt: Arc<AtomicUsize>,
    max_concurrent: Mutex<usize>,
}

impl FilterRegistry {
    pub fn new(max_concurrent_filters: usize) -> Self {
        let limit = clamp_concurrency(max_concurrent_filters);
        Self {
            filters: Mutex::new(BTreeMap::new()),
            permits: Arc::new(Semaphore::new(limit)),
            debt: Arc::new(AtomicUsize::new(0)),
            max_concurrent: Mutex::new(limit),
        }
    }

    /// Register a filter under its own name, replacing any previous one
    pub fn add_filter(&self, filter: Arc<dyn TransactionFilter>) {
        let name = filter.name().to_string();
        let previous = self.lock_filters().insert(
            name.clone(),
            Registration {
                filter,
                hits: Arc::new(AtomicU64::new(0)),
            },
        );
        if previous.is_some() {
            warn!(filter = %name, "Replaced existing filter");
        } else {
            info!(filter = %name, "Filter registered");
        }
    }

    pub fn remove_filter(&self, name: &str) -> bool {
        let removed = self.lock_filters().remove(name).is_some();
        if removed {
            info!(filter = %name, "Filter removed");
        }
        removed
    }

    pub fn update_filter_config(&self, name: &str, json: &str) -> Result<()> {
        let filter = self
            .get_filter(name)
            .ok_or_else(|| Error::FilterNotFound(name.to_string()))?;
        filter.update_config(json)
    }

    pub fn get_filter(&self, name: &str) -> Option<Arc<dyn TransactionFilter>> {
        self.lock_filters().get(name).map(|r| r.filter.clone())
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.lock_filters().keys().cloned().collect()
    }

    pub fn max_concurrent_filters(&self) -> usize {
        *self.max_concurrent.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Resize the fan-out bound on the shared semaphore. Shrinking retires
    /// idle permits now and in-flight ones as they are returned.
    pub fn set_max_concurrent_filters(&self, max: usize) {
        let limit = clamp_concurrency(max);
        let mut current = self.max_concurrent.lock().unwrap_or_else(|p| p.into_inner());

        if limit > *current {
            let mut grow = limit - *current;
            while grow > 0 && pay_debt(&self.debt) {
                grow -= 1;
            }
            self.permits.add_permits(grow);
        } else if limit < *current {
            let shrink = *current - limit;
            self.debt.fetch_add(shrink, Ordering::SeqCst);
            let forgotten = self.permits.forget_permits(shrink);
            // A returning permit may have paid part of the debt in between
            let excess = (0..forgotten).filter(|_| !pay_debt(&self.debt)).count();
            self.permits.add_permits(excess);
        }

        *current = limit;
        info!("Max concurrent filters set to {}", limit);
    }

    #[cfg(test)]
    async fn acquire(&self) -> Result<FilterPermit> {
        acquire_permit(self.permits.clone(), self.debt.clone()).await
    }

    /// Run one transaction through every filter; returns the number that matched
    pub async fn process_transaction(&self, source_id: SourceId, tx: Arc<TransactionEvent>) -> usize {
        let targets: Vec<(String, Arc<dyn TransactionFilter>, Arc<AtomicU64>)> = self
            .lock_filters()
            .iter()
            .map(|(name, r)| (name.clone(), r.filter.clone(), r.hits.clone()))
            .collect();

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(name, filter, hits)| {
                let permits = self.permits.clone();
                let debt = self.debt.clone();
                let tx = tx.clone();
                let task = tokio::spawn(async move {
                    let _permit = acquire_permit(permits, debt).await?;
                    let matched = filter.process_transaction(&source_id, &tx)?;
                    if matched {
                        hits.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok::<bool, Error>(matched)
                });
                (name, task)
            })
            .collect();

        let mut matched = 0;
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(true)) => matched += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(filter = %name, signature = %tx.signature, "Filter error: {}", e),
                Err(e) => error!(filter = %name, signature = %tx.signature, "Filter task panicked: {}", e),
            }
        }
        matched
    }

    /// One concurrent task per transaction; returns the summed match count
    pub async fn process_batch(self: &Arc<Self>, source_id: SourceId, txs: &[Arc<TransactionEvent>]) -> usize {
        let tasks: Vec<_> = txs
            .iter()
            .cloned()
            .map(|tx| {
                let registry = self.clone();
                tokio::spawn(async move { registry.process_transaction(source_id, tx).await })
            })
            .collect();

        let mut total = 0;
        for task in tasks {
            match task.await {
                Ok(matched) => total += matched,
                Err(e) => error!("Batch fan-out task failed: {}", e),
            }
        }
        debug!(%source_id, transactions = txs.len(), matched = total, "Batch filtered");
        total
    }

    pub fn stats(&self) -> BTreeMap<String, FilterStats> {
        self.lock_filters()
            .iter()
            .map(|(name, r)| {
                (
                    name.clone(),
                    FilterStats {
                        hits: r.hits.load(Ordering::Relaxed),
                        processed: r.filter.counters().processed(),
                        matched: r.filter.counters().matched(),
                    },
                )
            })
            .collect()
    }

    fn lock_filters(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Registration>> {
        self.filters.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new(default_half_cores())
    }
}

fn clamp_concurrency(requested: usize) -> usize {
    let hardware = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    requested.clamp(1, hardware.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::types::FilterCounters;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    enum Behaviour {
        Match,
        Miss,
        Fail,
        Panic,
    }

    struct Scripted {
        name: String,
        behaviour: Behaviour,
        counters: FilterCounters,
    }

    impl Scripted {
        fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                behaviour,
                counters: FilterCounters::default(),
            })
        }
    }

    impl TransactionFilter for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn counters(&self) -> &FilterCounters {
            &self.counters
        }

        fn evaluate(&self, _: &SourceId, _: &TransactionEvent) -> Result<bool> {
            match self.behaviour {
                Behaviour::Match => Ok(true),
                Behaviour::Miss => Ok(false),
                Behaviour::Fail => Err(Error::Filter {
                    filter: self.name.clone(),
                    reason: "scripted failure".into(),
                }),
                Behaviour::Panic => panic!("scripted panic"),
            }
        }

        fn update_config(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn tx(sig: &str) -> Arc<TransactionEvent> {
        Arc::new(TransactionEvent {
            signature: sig.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let registry = FilterRegistry::new(4);
        registry.add_filter(Scripted::new("a", Behaviour::Match));
        registry.add_filter(Scripted::new("b", Behaviour::Fail));
        registry.add_filter(Scripted::new("c", Behaviour::Panic));
        registry.add_filter(Scripted::new("d", Behaviour::Match));
        registry.add_filter(Scripted::new("e", Behaviour::Miss));

        let matched = registry.process_transaction(SourceId::new(), tx("s1")).await;
        assert_eq!(matched, 2);

        let stats = registry.stats();
        assert_eq!(stats["a"].hits, 1);
        assert_eq!(stats["b"].hits, 0);
        assert_eq!(stats["b"].processed, 1);
        assert_eq!(stats["e"].processed, 1);
        assert_eq!(stats["e"].matched, 0);
        assert_eq!(stats["c"].processed, 1);
        assert_eq!(stats["c"].matched, 0);
        assert_eq!(stats["c"].hits, 0);
    }

    #[tokio::test]
    async fn test_panicking_filter_counted_every_call() {
        let registry = FilterRegistry::new(2);
        registry.add_filter(Scripted::new("boom", Behaviour::Panic));
        registry.add_filter(Scripted::new("ok", Behaviour::Match));

        for i in 0..3 {
            let matched = registry.process_transaction(SourceId::new(), tx(&format!("p{i}"))).await;
            assert_eq!(matched, 1);
        }
        let stats = registry.stats();
        assert_eq!(stats["boom"].processed, 3);
        assert_eq!(stats["boom"].matched, 0);
        assert_eq!(stats["ok"].hits, 3);
        // Permits held by the panicking tasks came back
        assert_eq!(registry.permits.available_permits(), registry.max_concurrent_filters());
    }

    #[tokio::test]
    async fn test_shrinking_bound_retires_in_flight_permits() {
        let registry = FilterRegistry::new(usize::MAX);
        let full = registry.max_concurrent_filters();

        let mut held = Vec::new();
        for _ in 0..full {
            held.push(registry.acquire().await.unwrap());
        }
        assert_eq!(registry.permits.available_permits(), 0);

        registry.set_max_concurrent_filters(1);
        assert_eq!(registry.max_concurrent_filters(), 1);
        drop(held);
        assert_eq!(registry.permits.available_permits(), 1);

        registry.set_max_concurrent_filters(full);
        assert_eq!(registry.permits.available_permits(), full);

        let idle_shrink = registry.acquire().await.unwrap();
        registry.set_max_concurrent_filters(1);
        assert_eq!(registry.permits.available_permits(), 0);
        drop(idle_shrink);
        assert_eq!(registry.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_batch_sums_matches() {
        let registry = Arc::new(FilterRegistry::new(2));
        registry.add_filter(Scripted::new("always", Behaviour::Match));
        registry.add_filter(Scripted::new("never", Behaviour::Miss));

        let batch: Vec<_> = (0..10).map(|i| tx(&format!("s{i}"))).collect();
        let matched = registry.process_batch(SourceId::new(), &batch).await;
        assert_eq!(matched, 10);
        assert_eq!(registry.stats()["always"].hits, 10);
        assert_eq!(registry.stats()["never"].processed, 10);
    }

    struct Gauge {
        name: String,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        counters: FilterCounters,
    }

    impl TransactionFilter for Gauge {
        fn name(&self) -> &str {
            &self.name
        }

        fn counters(&self) -> &FilterCounters {
            &self.counters
        }

        fn evaluate(&self, _: &SourceId, _: &TransactionEvent) -> Result<bool> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(false)
        }

        fn update_config(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_respects_bound() {
        let registry = Arc::new(FilterRegistry::new(1));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            registry.add_filter(Arc::new(Gauge {
                name: format!("g{i}"),
                current: current.clone(),
                peak: peak.clone(),
                counters: FilterCounters::default(),
            }));
        }

        let batch: Vec<_> = (0..8).map(|i| tx(&format!("s{i}"))).collect();
        registry.process_batch(SourceId::new(), &batch).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(registry.max_concurrent_filters(), 1);
        assert!(registry.stats().values().all(|s| s.processed == 8));
    }

    #[tokio::test]
    async fn test_registration_management() {
        let registry = FilterRegistry::new(0);
        assert_eq!(registry.max_concurrent_filters(), 1);

        registry.add_filter(Scripted::new("x", Behaviour::Miss));
        assert_eq!(registry.filter_names(), vec!["x".to_string()]);
        assert!(registry.update_filter_config("x", "{}").is_ok());
        assert!(matches!(
            registry.update_filter_config("missing", "{}"),
            Err(Error::FilterNotFound(_))
        ));
        assert!(registry.remove_filter("x"));
        assert!(!registry.remove_filter("x"));
        assert_eq!(registry.process_transaction(SourceId::new(), tx("s")).await, 0);
    }
}
