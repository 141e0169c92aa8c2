//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_half_cores")]
    pub http_threads: usize,
    #[serde(default = "default_half_cores")]
    pub max_concurrent_filters: usize,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
}

/// One upstream Geyser endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DataSourceConfig {
    pub address: String,
    #[serde(default, alias = "type")]
    pub kind: SourceKind,
    /// Access token sent as `x-token` metadata
    #[serde(default)]
    pub x_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Geyser,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Geyser => write!(f, "geyser"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Commitment {
    #[default]
    Processed,
    Confirmed,
    Finalized,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Flush threshold for a worker's batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub commitment: Commitment,
    /// Flush the partial batch on shutdown instead of discarding it
    #[serde(default)]
    pub flush_partial_on_shutdown: bool,
    #[serde(default = "default_max_decoding_message_size")]
    pub max_decoding_message_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_block_cache_mb")]
    pub block_cache_mb: usize,
    #[serde(default = "default_write_buffer_mb")]
    pub write_buffer_mb: usize,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: i32,
    /// fsync every write batch (off by default, the WAL stays on)
    #[serde(default)]
    pub sync_writes: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersConfig {
    #[serde(default)]
    pub dex: DexFilterConfig,
    #[serde(default)]
    pub swap: SwapFilterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DexFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Program ids to match; empty keeps the built-in set
    #[serde(default)]
    pub programs: Vec<String>,
    /// Display names keyed by program id
    #[serde(default)]
    pub names: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub smart_wallets: Vec<String>,
    #[serde(default = "default_min_swap_amount")]
    pub min_swap_amount: f64,
    /// Allow-list of mints; empty means all
    #[serde(default)]
    pub tracked_tokens: Vec<String>,
    #[serde(default)]
    pub ignored_tokens: Vec<String>,
    #[serde(default)]
    pub token_names: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    8080
}

/// Half of the available parallelism, never less than one
pub fn default_half_cores() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / 2).max(1)
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_max_decoding_message_size() -> usize {
    64 * 1024 * 1024
}

fn default_db_path() -> String {
    "solana_monitor_db".to_string()
}

fn default_block_cache_mb() -> usize {
    1024
}

fn default_write_buffer_mb() -> usize {
    128
}

fn default_max_open_files() -> i32 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

fn default_min_swap_amount() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            commitment: Commitment::default(),
            flush_partial_on_shutdown: false,
            max_decoding_message_size: default_max_decoding_message_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            block_cache_mb: default_block_cache_mb(),
            write_buffer_mb: default_write_buffer_mb(),
            max_open_files: default_max_open_files(),
            sync_writes: false,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            telegram: None,
            discord: None,
        }
    }
}

impl Default for DexFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            programs: vec![],
            names: HashMap::new(),
        }
    }
}

impl Default for SwapFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smart_wallets: vec![],
            min_swap_amount: default_min_swap_amount(),
            tracked_tokens: vec![],
            ignored_tokens: vec![],
            token_names: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (MONITOR__HTTP_PORT, MONITOR__STORAGE__PATH, ...)
            .add_source(
                config::Environment::with_prefix("MONITOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for source in &self.data_sources {
            let url = url::Url::parse(&source.address)
                .with_context(|| format!("Invalid data source address: {}", source.address))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!(
                    "Data source {} must use http or https, got {}",
                    source.address,
                    url.scheme()
                );
            }
        }

        if self.ingest.batch_size == 0 {
            anyhow::bail!("ingest.batch_size must be positive");
        }

        if self.ingest.connect_timeout_secs == 0 {
            anyhow::bail!("ingest.connect_timeout_secs must be positive");
        }

        if self.http_threads == 0 {
            anyhow::bail!("http_threads must be positive");
        }

        if self.health_check_interval_secs == 0 {
            anyhow::bail!("health_check_interval_secs must be positive");
        }

        if self.storage.path.trim().is_empty() {
            anyhow::bail!("storage.path cannot be empty");
        }

        if self.notifications.max_attempts == 0 {
            anyhow::bail!("notifications.max_attempts must be at least 1");
        }

        if let Some(telegram) = &self.notifications.telegram {
            if telegram.bot_token.is_empty() || telegram.chat_id.is_empty() {
                anyhow::bail!("telegram requires both bot_token and chat_id");
            }
        }

        if let Some(discord) = &self.notifications.discord {
            url::Url::parse(&discord.webhook_url).context("Invalid discord webhook_url")?;
        }

        if self.filters.swap.min_swap_amount < 0.0 {
            anyhow::bail!("filters.swap.min_swap_amount cannot be negative");
        }

        for wallet in &self.filters.swap.smart_wallets {
            validate_pubkey(wallet).with_context(|| format!("Invalid smart wallet: {}", wallet))?;
        }

        for program in &self.filters.dex.programs {
            validate_pubkey(program)
                .with_context(|| format!("Invalid DEX program id: {}", program))?;
        }

        if self.data_sources.is_empty() {
            warn!("No data sources configured - the monitor will only serve HTTP");
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ingest.connect_timeout_secs)
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let sources: Vec<String> = self
            .data_sources
            .iter()
            .map(|s| {
                format!(
                    "    - {} ({}, x_token: {})",
                    mask_url(&s.address),
                    s.kind,
                    if s.x_token.is_some() { "***" } else { "(not set)" }
                )
            })
            .collect();

        format!(
            r#"Configuration:
  log_level: {}
  http: port {} ({} threads)
  health_check_interval: {}s
  Data sources:
{}
  Ingest:
    batch_size: {}
    connect_timeout: {}s
    commitment: {:?}
    flush_partial_on_shutdown: {}
  Storage:
    path: {}
    block_cache: {} MB
    write_buffer: {} MB
    sync_writes: {}
  Notifications:
    enabled: {}
    max_attempts: {}
    telegram: {}
    discord: {}
  Filters:
    max_concurrent: {}
    dex: enabled={} programs={}
    swap: enabled={} smart_wallets={} min_swap_amount={}
"#,
            self.log_level,
            self.http_port,
            self.http_threads,
            self.health_check_interval_secs,
            if sources.is_empty() {
                "    (none)".to_string()
            } else {
                sources.join("\n")
            },
            self.ingest.batch_size,
            self.ingest.connect_timeout_secs,
            self.ingest.commitment,
            self.ingest.flush_partial_on_shutdown,
            self.storage.path,
            self.storage.block_cache_mb,
            self.storage.write_buffer_mb,
            self.storage.sync_writes,
            self.notifications.enabled,
            self.notifications.max_attempts,
            match &self.notifications.telegram {
                Some(t) => format!("bot_token=*** chat_id={}", t.chat_id),
                None => "(not set)".to_string(),
            },
            match &self.notifications.discord {
                Some(d) => mask_url(&d.webhook_url),
                None => "(not set)".to_string(),
            },
            self.max_concurrent_filters,
            self.filters.dex.enabled,
            self.filters.dex.programs.len(),
            self.filters.swap.enabled,
            self.filters.swap.smart_wallets.len(),
            self.filters.swap.min_swap_amount,
        )
    }
}

/// Check that a base58 string decodes to a 32-byte key
fn validate_pubkey(value: &str) -> Result<()> {
    let bytes = bs58::decode(value).into_vec().context("not base58")?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32 bytes, got {}", bytes.len());
    }
    Ok(())
}

/// Mask URL for display (hide path tokens and query params)
fn mask_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let origin = parsed.origin().ascii_serialization();
            if parsed.query().is_some() || parsed.path().len() > 1 {
                format!("{}/***", origin)
            } else {
                origin
            }
        }
        Err(_) => "***".to_string(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http_port: default_http_port(),
            http_threads: default_half_cores(),
            max_concurrent_filters: default_half_cores(),
            health_check_interval_secs: default_health_check_interval(),
            data_sources: vec![],
            ingest: IngestConfig::default(),
            storage: StorageConfig::default(),
            notifications: NotificationConfig::default(),
            filters: FiltersConfig::default(),
        }
    }
}

/// Shared, reloadable view of the configuration file
pub struct ConfigHandle {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn current(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-read the file; the previous configuration stays active on failure
    pub fn reload(&self) -> bool {
        match Config::load(&self.path) {
            Ok(config) => {
                match self.current.write() {
                    Ok(mut guard) => *guard = Arc::new(config),
                    Err(poisoned) => *poisoned.into_inner() = Arc::new(config),
                }
                info!(path = %self.path.display(), "Configuration reloaded");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), "Configuration reload failed: {:#}", e);
                false
            }
        }
    }
}
