//! CLI command implementations

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigHandle};
use crate::filter::{DexFilter, FilterRegistry, SwapFilter, TransactionFilter};
use crate::http::{AppState, HttpServer};
use crate::notify::{DiscordPlugin, NotificationDispatcher, RetryPolicy, TelegramPlugin};
use crate::pipeline::Pipeline;
use crate::source::{IngestSettings, SourceManager};
use crate::storage::StorageEngine;
use crate::stream::{decode_stored, GeyserConnector, YellowstoneConnector};

/// Everything `start` wires together
pub struct Services {
    pub storage: Arc<StorageEngine>,
    pub filters: Arc<FilterRegistry>,
    pub dex: Arc<DexFilter>,
    pub swap: Arc<SwapFilter>,
    pub notifier: Arc<NotificationDispatcher>,
    pub sources: Arc<SourceManager>,
}

impl Services {
    /// Open storage and build the pipeline; sources are added by the caller
    pub fn build(config: &Config, connector: Arc<dyn GeyserConnector>) -> Result<Self> {
        let storage = Arc::new(
            StorageEngine::open(&config.storage)
                .with_context(|| format!("failed to open store at {}", config.storage.path))?,
        );

        let filters = Arc::new(FilterRegistry::new(config.max_concurrent_filters));
        let dex = Arc::new(DexFilter::new(&config.filters.dex));
        let swap = Arc::new(SwapFilter::new(&config.filters.swap));
        if config.filters.dex.enabled {
            filters.add_filter(dex.clone());
        }
        if config.filters.swap.enabled {
            filters.add_filter(swap.clone());
        }

        let notifier = Arc::new(NotificationDispatcher::new(
            RetryPolicy::from_config(&config.notifications),
            config.notifications.enabled,
        ));
        let attempt_timeout = Duration::from_secs(config.notifications.attempt_timeout_secs);
        if let Some(telegram) = &config.notifications.telegram {
            if !telegram.bot_token.is_empty() && !telegram.chat_id.is_empty() {
                notifier.add_plugin(Arc::new(TelegramPlugin::new(
                    &telegram.bot_token,
                    &telegram.chat_id,
                    attempt_timeout,
                )?));
            }
        }
        if let Some(discord) = &config.notifications.discord {
            if !discord.webhook_url.is_empty() {
                notifier.add_plugin(Arc::new(DiscordPlugin::new(&discord.webhook_url, attempt_timeout)?));
            }
        }

        let pipeline = Arc::new(Pipeline::new(filters.clone(), storage.clone(), notifier.clone()));
        let sources = Arc::new(SourceManager::new(
            connector,
            pipeline,
            IngestSettings::from_config(config),
        ));

        Ok(Self {
            storage,
            filters,
            dex,
            swap,
            notifier,
            sources,
        })
    }

    /// Push a reloaded configuration into the running components
    pub fn apply(&self, config: &Config) {
        self.toggle(self.dex.clone(), config.filters.dex.enabled);
        self.toggle(self.swap.clone(), config.filters.swap.enabled);

        let updates = [
            (DexFilter::NAME, DexFilter::config_update(&config.filters.dex)),
            (SwapFilter::NAME, SwapFilter::config_update(&config.filters.swap)),
        ];
        for (name, update) in updates {
            if self.filters.get_filter(name).is_none() {
                continue;
            }
            if let Err(e) = self.filters.update_filter_config(name, &update.to_string()) {
                error!(filter = name, "Failed to apply filter config: {}", e);
            }
        }

        self.filters.set_max_concurrent_filters(config.max_concurrent_filters);
        self.notifier.set_notifications_enabled(config.notifications.enabled);
        self.sources.update_settings(IngestSettings::from_config(config));
    }

    fn toggle(&self, filter: Arc<dyn TransactionFilter>, enabled: bool) {
        let registered = self.filters.get_filter(filter.name()).is_some();
        if enabled && !registered {
            self.filters.add_filter(filter);
        } else if !enabled && registered {
            self.filters.remove_filter(filter.name());
        }
    }

    pub fn http_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.sources.clone(),
            self.filters.clone(),
            Some(self.dex.clone()),
            Some(self.swap.clone()),
            self.notifier.clone(),
            self.storage.clone(),
        ))
    }

    /// Sources first so the last batches still reach the notifier and store
    pub async fn shutdown(&self) {
        self.sources.shutdown().await;
        self.notifier.shutdown().await;

        let storage = self.storage.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || storage.shutdown()).await {
            error!("Storage shutdown failed: {}", e);
        }
    }
}

/// Run the monitor until Ctrl+C or SIGTERM
pub async fn start(handle: ConfigHandle) -> Result<()> {
    let config = handle.current();

    info!("Starting Geyser monitor...");
    info!(
        "Sources: {}, batch size: {}, commitment: {:?}",
        config.data_sources.len(),
        config.ingest.batch_size,
        config.ingest.commitment
    );
    if config.data_sources.is_empty() {
        warn!("No data sources configured - only the HTTP surface will be live");
    }

    let connector = Arc::new(YellowstoneConnector::new(
        config.connect_timeout(),
        config.ingest.max_decoding_message_size,
    ));
    let services = Services::build(&config, connector)?;

    for source in &config.data_sources {
        let id = services.sources.add_source(source.clone());
        info!(source_id = %id, "Added data source {}", source.address);
    }
    services
        .sources
        .start_health_checks(Duration::from_secs(config.health_check_interval_secs));

    let mut http = HttpServer::start(config.http_port, config.http_threads, services.http_state())
        .with_context(|| format!("failed to start HTTP server on port {}", config.http_port))?;

    info!("Monitor running. Press Ctrl+C to stop.");
    let outcome = wait_for_shutdown(&handle, &services).await;

    info!("Shutting down...");
    tokio::task::spawn_blocking(move || http.stop()).await?;
    services.shutdown().await;
    info!("Shutdown complete");

    outcome
}

#[cfg(unix)]
async fn wait_for_shutdown(handle: &ConfigHandle, services: &Services) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                if handle.reload() {
                    services.apply(&handle.current());
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_handle: &ConfigHandle, _services: &Services) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Look up a stored transaction and print what it contains
pub async fn get(config: &Config, signature: &str) -> Result<()> {
    let storage = StorageEngine::open(&config.storage)?;
    let payload = storage.get_transaction(signature).wait().await;
    storage.shutdown();

    let Some(payload) = payload? else {
        anyhow::bail!("transaction {} not found", signature);
    };

    println!("\n=== TRANSACTION {} ===\n", signature);
    println!("Payload: {} bytes", payload.len());
    match decode_stored(&payload) {
        Ok(event) => {
            println!("Slot: {}", event.slot);
            println!("Accounts: {}", event.account_keys.len());
            for (i, key) in event.account_keys.iter().enumerate() {
                println!("  [{:>2}] {}", i, key);
            }
            println!("Instructions: {}", event.instructions.len());
            for ix in &event.instructions {
                println!(
                    "  {} ({} accounts, {} bytes data)",
                    event.account_key(ix.program_id_index as usize).unwrap_or("?"),
                    ix.accounts.len(),
                    ix.data.len()
                );
            }
            println!("Token balance changes: {}", event.post_token_balances.len());
        }
        Err(e) => println!("Payload could not be decoded: {}", e),
    }
    Ok(())
}

/// Back up the store into `dir` and wait for completion
pub async fn backup(config: &Config, dir: &Path) -> Result<()> {
    let storage = StorageEngine::open(&config.storage)?;
    let outcome = storage.backup_data(dir).wait().await;
    storage.shutdown();
    outcome.with_context(|| format!("backup to {} failed", dir.display()))?;

    println!("Backup written to {}", dir.display());
    Ok(())
}

/// Full compaction of the store
pub fn compact(config: &Config) -> Result<()> {
    let storage = StorageEngine::open(&config.storage)?;
    let started = std::time::Instant::now();
    storage.optimize_db()?;
    storage.shutdown();

    println!("Compaction finished in {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}
