//! RocksDB persistence behind a single background worker thread
//!
//! Producers enqueue [`StorageTask`]s and get a receipt back immediately.
//! The worker drains the queue in FIFO order; a failed write is logged,
//! reported on its receipt and dropped.

use rocksdb::backup::{BackupEngine, BackupEngineOptions};
use rocksdb::{
    BlockBasedOptions, BottommostLevelCompaction, Cache, CompactOptions, DBCompactionStyle,
    DBCompressionType, Env, Options, WriteBatch, WriteOptions, DB,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::{Error, Result};

const MB: usize = 1024 * 1024;

/// Key/value pair as written to the store
pub type Entry = (Vec<u8>, Vec<u8>);

/// Outcome of one enqueued task
pub struct StorageReceipt<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> StorageReceipt<T> {
    fn closed() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(Error::StorageClosed));
        Self { rx }
    }

    /// Wait for the worker to finish the task
    pub async fn wait(self) -> Result<T> {
        self.rx.await.map_err(|_| Error::StorageClosed)?
    }

    /// Blocking wait, for callers outside the runtime
    pub fn blocking_wait(self) -> Result<T> {
        self.rx.blocking_recv().map_err(|_| Error::StorageClosed)?
    }
}

pub enum StorageTask {
    Batch {
        entries: Vec<Entry>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Get {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    Backup {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, Default)]
struct StorageCounters {
    stored_transactions: AtomicU64,
    batches: AtomicU64,
    failed_tasks: AtomicU64,
}

pub struct StorageEngine {
    db: Arc<DB>,
    path: PathBuf,
    counters: Arc<StorageCounters>,
    sender: Mutex<Option<mpsc::UnboundedSender<StorageTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StorageEngine {
    /// Open (or create) the store and start its worker; failure here is fatal
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        let options = engine_options(config);
        let db = DB::open(&options, &path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))?;
        let db = Arc::new(db);

        let write_options = {
            let mut w = WriteOptions::default();
            w.set_sync(config.sync_writes);
            w.disable_wal(false);
            w
        };

        let counters = Arc::new(StorageCounters::default());
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("storage-worker".to_string())
            .spawn({
                let db = db.clone();
                let counters = counters.clone();
                move || run_worker(db, write_options, counters, receiver)
            })?;

        info!("Storage opened at {}", path.display());

        Ok(Self {
            db,
            path,
            counters,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one atomic multi-key write
    pub fn store_batch(&self, entries: Vec<Entry>) -> StorageReceipt<usize> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(StorageTask::Batch { entries, reply }, rx)
    }

    pub fn get_transaction(&self, key: impl Into<Vec<u8>>) -> StorageReceipt<Option<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(StorageTask::Get { key: key.into(), reply }, rx)
    }

    pub fn backup_data(&self, path: impl Into<PathBuf>) -> StorageReceipt<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(StorageTask::Backup { path: path.into(), reply }, rx)
    }

    /// Full compaction on the calling thread
    pub fn optimize_db(&self) -> Result<()> {
        let mut options = CompactOptions::default();
        options.set_bottommost_level_compaction(BottommostLevelCompaction::Force);
        info!("Compacting {}", self.path.display());
        self.db.compact_range_opt(None::<&[u8]>, None::<&[u8]>, &options);
        info!("Compaction finished");
        Ok(())
    }

    pub fn total_stored_transactions(&self) -> u64 {
        self.counters.stored_transactions.load(Ordering::Relaxed)
    }

    pub fn total_batches(&self) -> u64 {
        self.counters.batches.load(Ordering::Relaxed)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.counters.failed_tasks.load(Ordering::Relaxed)
    }

    /// Close the queue, let the worker drain what is left, then join it
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(sender);

        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Storage worker panicked");
            } else {
                info!("Storage worker stopped");
            }
        }
    }

    fn enqueue<T>(&self, task: StorageTask, rx: oneshot::Receiver<Result<T>>) -> StorageReceipt<T> {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(sender) if sender.send(task).is_ok() => StorageReceipt { rx },
            _ => {
                warn!("Storage task rejected: worker stopped");
                StorageReceipt::closed()
            }
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn engine_options(config: &StorageConfig) -> Options {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.set_compaction_style(DBCompactionStyle::Level);
    options.set_compression_type(DBCompressionType::Lz4);
    options.set_write_buffer_size(config.write_buffer_mb * MB);
    options.set_max_open_files(config.max_open_files);

    let mut table = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_mb * MB);
    table.set_block_cache(&cache);
    table.set_bloom_filter(10.0, false);
    options.set_block_based_table_factory(&table);
    options
}

fn run_worker(
    db: Arc<DB>,
    write_options: WriteOptions,
    counters: Arc<StorageCounters>,
    mut receiver: mpsc::UnboundedReceiver<StorageTask>,
) {
    debug!("Storage worker started");
    // Returns None only once every sender is gone and the queue is empty
    while let Some(task) = receiver.blocking_recv() {
        match task {
            StorageTask::Batch { entries, reply } => {
                let result = write_batch(&db, &write_options, &entries);
                match &result {
                    Ok(count) => {
                        // Every completed batch task counts, empty ones included
                        counters.stored_transactions.fetch_add(*count as u64, Ordering::Relaxed);
                        counters.batches.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                        error!("Batch write of {} entries dropped: {}", entries.len(), e);
                    }
                }
                let _ = reply.send(result);
            }
            StorageTask::Get { key, reply } => {
                let result = db.get(&key).map_err(Error::from);
                if let Err(e) = &result {
                    counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                    error!("Lookup failed: {}", e);
                }
                let _ = reply.send(result);
            }
            StorageTask::Backup { path, reply } => {
                let result = backup(&db, &path);
                match &result {
                    Ok(()) => info!("Backup written to {}", path.display()),
                    Err(e) => {
                        counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                        error!("Backup to {} failed: {}", path.display(), e);
                    }
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("Storage worker drained");
}

fn write_batch(db: &DB, options: &WriteOptions, entries: &[Entry]) -> Result<usize> {
    if entries.is_empty() {
        return Ok(0);
    }
    let mut batch = WriteBatch::default();
    for (key, value) in entries {
        batch.put(key, value);
    }
    db.write_opt(batch, options)?;
    Ok(entries.len())
}

fn backup(db: &DB, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    let options = BackupEngineOptions::new(path)?;
    let env = Env::new()?;
    let mut engine = BackupEngine::open(&options, &env)?;
    engine.create_new_backup_flush(db, true)?;
    Ok(())
}
