//! One ingestion worker per data source
//!
//! The worker connects with a timeout, then drives the subscribe call state
//! machine until cancelled. Full batches go through the pipeline in arrival
//! order; storage and notification receipts are watched off the read path.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DataSourceConfig, SourceKind};
use crate::error::{Error, Result};
use crate::pipeline::{FlushReport, Pipeline};
use crate::stream::{
    Batch, CallEvent, CallState, GeyserConnector, GeyserSession, SourceEndpoint, SourceId,
    StreamUpdate, SubscribeSpec, TransactionEvent,
};

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub batch_size: usize,
    pub connect_timeout: Duration,
    pub subscribe: SubscribeSpec,
    pub flush_partial_on_shutdown: bool,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.ingest.batch_size,
            connect_timeout: config.connect_timeout(),
            subscribe: SubscribeSpec::transactions(config.ingest.commitment),
            flush_partial_on_shutdown: config.ingest.flush_partial_on_shutdown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Connecting,
    Streaming,
    Disconnected,
    Stopped,
}

impl WorkerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerPhase::Connecting,
            1 => WorkerPhase::Streaming,
            2 => WorkerPhase::Disconnected,
            _ => WorkerPhase::Stopped,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    phase: AtomicU8,
    total_transactions: AtomicU64,
    processed_batches: AtomicU64,
    storage_failures: AtomicU64,
    notification_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WorkerStats {
    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    pub fn total_transactions(&self) -> u64 {
        self.total_transactions.load(Ordering::Relaxed)
    }

    pub fn processed_batches(&self) -> u64 {
        self.processed_batches.load(Ordering::Relaxed)
    }

    pub fn storage_failures(&self) -> u64 {
        self.storage_failures.load(Ordering::Relaxed)
    }

    pub fn notification_failures(&self) -> u64 {
        self.notification_failures.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn record_error(&self, error: &Error) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(error.to_string());
    }
}

/// Point-in-time view of one data source
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub id: SourceId,
    pub address: String,
    pub kind: SourceKind,
    pub connected: bool,
    pub phase: WorkerPhase,
    pub total_transactions: u64,
    pub processed_batches: u64,
    pub storage_failures: u64,
    pub notification_failures: u64,
    pub last_error: Option<String>,
}

pub struct IngestionWorker {
    id: SourceId,
    source: DataSourceConfig,
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IngestionWorker {
    pub fn spawn(
        id: SourceId,
        source: DataSourceConfig,
        settings: IngestSettings,
        connector: Arc<dyn GeyserConnector>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let cancel = CancellationToken::new();

        let runner = Runner {
            id,
            endpoint: SourceEndpoint {
                address: source.address.clone(),
                x_token: source.x_token.clone(),
            },
            settings,
            connector,
            pipeline,
            stats: stats.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(runner.run());

        info!(source_id = %id, address = %source.address, "Ingestion worker started");

        Self {
            id,
            source,
            stats,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.source.address
    }

    pub fn source(&self) -> &DataSourceConfig {
        &self.source
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.stats.phase() == WorkerPhase::Streaming
    }

    /// Disconnected or no longer running
    pub fn needs_replacement(&self) -> bool {
        matches!(
            self.stats.phase(),
            WorkerPhase::Disconnected | WorkerPhase::Stopped
        ) || self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            id: self.id,
            address: self.source.address.clone(),
            kind: self.source.kind,
            connected: self.is_connected(),
            phase: self.stats.phase(),
            total_transactions: self.stats.total_transactions(),
            processed_batches: self.stats.processed_batches(),
            storage_failures: self.stats.storage_failures(),
            notification_failures: self.stats.notification_failures(),
            last_error: self.stats.last_error(),
        }
    }

    /// Cancel and wait for the task to finish its shutdown path
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(source_id = %self.id, "Ingestion worker ended abnormally: {}", e);
            }
        }
        info!(source_id = %self.id, "Ingestion worker stopped");
    }
}

impl Drop for IngestionWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Runner {
    id: SourceId,
    endpoint: SourceEndpoint,
    settings: IngestSettings,
    connector: Arc<dyn GeyserConnector>,
    pipeline: Arc<Pipeline>,
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
}

type Step = (CallState, Option<Vec<Arc<TransactionEvent>>>);

impl Runner {
    async fn run(self) {
        self.stats.set_phase(WorkerPhase::Connecting);

        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.endpoint),
        );
        let mut session = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.stats.set_phase(WorkerPhase::Stopped);
                return;
            }
            result = connect => match result {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => return self.fail(e),
                Err(_) => {
                    let ms = self.settings.connect_timeout.as_millis() as u64;
                    return self.fail(Error::ConnectionTimeout(ms));
                }
            }
        };

        let mut batch = Batch::new(self.settings.batch_size);
        let mut state = CallState::Start;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                step = self.step(state, session.as_mut(), &mut batch) => step,
            };

            match step {
                Ok((next, full)) => {
                    state = next;
                    if let Some(events) = full {
                        self.flush(events).await;
                    }
                }
                Err(e) => return self.fail(e),
            }
        }

        self.finish_partial(&mut batch).await;
        self.stats.set_phase(WorkerPhase::Stopped);
    }

    async fn step(
        &self,
        mut state: CallState,
        session: &mut dyn GeyserSession,
        batch: &mut Batch,
    ) -> Result<Step> {
        let mut full = None;

        let event = match &mut state {
            CallState::Start => CallEvent::Opened(session.open_call().await?),
            CallState::Write(call) => match call.send_request(&self.settings.subscribe).await {
                Ok(()) => {
                    self.stats.set_phase(WorkerPhase::Streaming);
                    info!(source_id = %self.id, "Subscribed to {}", self.endpoint.address);
                    CallEvent::RequestSent
                }
                Err(e) if e.is_retryable() => {
                    self.disconnected(&e);
                    CallEvent::Failed
                }
                Err(e) => return Err(e),
            },
            CallState::Read(call) => match call.next_update().await {
                Some(Ok(StreamUpdate::Transaction(event))) => {
                    self.stats.total_transactions.fetch_add(1, Ordering::Relaxed);
                    if batch.push(Arc::new(event)) {
                        full = Some(batch.take());
                    }
                    CallEvent::Received
                }
                Some(Ok(StreamUpdate::Ping)) => match call.send_ping().await {
                    Ok(()) => {
                        debug!(source_id = %self.id, "Answered server ping");
                        CallEvent::Received
                    }
                    Err(e) => {
                        self.disconnected(&e);
                        CallEvent::Failed
                    }
                },
                Some(Ok(StreamUpdate::Other)) => CallEvent::Received,
                Some(Err(Error::MalformedUpdate(reason))) => {
                    warn!(source_id = %self.id, "Skipping malformed update: {}", reason);
                    CallEvent::Received
                }
                Some(Err(e)) if e.is_retryable() => {
                    self.disconnected(&e);
                    CallEvent::Failed
                }
                // Not a transport problem; the health check restarts the source
                Some(Err(e)) => return Err(e),
                None => {
                    info!(source_id = %self.id, "Subscribe stream completed, reinitiating");
                    CallEvent::Completed
                }
            },
            CallState::Finished => CallEvent::Reinitiate,
        };

        Ok((state.advance(event), full))
    }

    async fn flush(&self, events: Vec<Arc<TransactionEvent>>) {
        let report = self.pipeline.flush(self.id, events).await;
        self.stats.processed_batches.fetch_add(1, Ordering::Relaxed);
        self.watch(report);
    }

    /// Follow receipts without holding up the read loop
    fn watch(&self, report: FlushReport) {
        let stats = self.stats.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = report.stored.wait().await {
                stats.storage_failures.fetch_add(1, Ordering::Relaxed);
                warn!(source_id = %id, "Batch of {} not persisted: {}", report.transactions, e);
            }
            for receipt in report.deliveries {
                let plugin = receipt.plugin().to_string();
                if !receipt.delivered().await {
                    stats.notification_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(source_id = %id, plugin = %plugin, "Batch notification not delivered");
                }
            }
        });
    }

    async fn finish_partial(&self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }
        if self.settings.flush_partial_on_shutdown {
            info!(source_id = %self.id, pending = batch.len(), "Flushing partial batch on shutdown");
            self.flush(batch.take()).await;
        } else {
            let discarded = batch.take().len();
            warn!(source_id = %self.id, discarded, "Discarding unflushed partial batch on shutdown");
        }
    }

    fn disconnected(&self, error: &Error) {
        self.stats.set_phase(WorkerPhase::Disconnected);
        self.stats.record_error(error);
        warn!(source_id = %self.id, "Subscribe call failed, reinitiating: {}", error);
    }

    fn fail(&self, error: Error) {
        self.stats.set_phase(WorkerPhase::Disconnected);
        self.stats.record_error(&error);
        error!(source_id = %self.id, address = %self.endpoint.address, "Ingestion worker failed: {}", error);
    }
}
