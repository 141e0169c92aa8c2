//! Data sources: one ingestion worker per upstream endpoint, owned by the manager

pub mod manager;
pub mod worker;

pub use manager::SourceManager;
pub use worker::{IngestSettings, IngestionWorker, SourceSnapshot, WorkerPhase, WorkerStats};
