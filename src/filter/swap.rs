//! Smart-wallet swap detection from token balance deltas

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

use super::ring::{RingBuffer, RECENT_CAPACITY};
use super::types::{FilterCounters, TransactionFilter};
use crate::config::SwapFilterConfig;
use crate::error::{Error, Result};
use crate::stream::{SourceId, TransactionEvent};

/// Wrapped SOL, the reference asset for buy/sell classification
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// Deltas below this are rounding noise
const DELTA_EPSILON: f64 = 1e-6;
const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SwapDirection {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SwapRecord {
    pub wallet: String,
    pub token_mint: String,
    pub token_name: String,
    pub token_amount: f64,
    /// Reference-asset amount moved by the same wallet
    pub sol_amount: f64,
    pub direction: SwapDirection,
    pub signature: String,
    pub source_id: SourceId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct SwapUpdate {
    smart_wallets: Option<Vec<String>>,
    min_swap_amount: Option<f64>,
    tracked_tokens: Option<Vec<String>>,
    ignored_tokens: Option<Vec<String>>,
    token_names: Option<HashMap<String, String>>,
}

#[derive(Debug)]
struct SwapSettings {
    smart_wallets: HashSet<String>,
    min_swap_amount: f64,
    tracked_tokens: HashSet<String>,
    ignored_tokens: HashSet<String>,
    token_names: HashMap<String, String>,
}

impl SwapSettings {
    fn default_names() -> HashMap<String, String> {
        HashMap::from([
            (WSOL_MINT.to_string(), "SOL".to_string()),
            (USDC_MINT.to_string(), "USDC".to_string()),
        ])
    }

    fn wants_mint(&self, mint: &str) -> bool {
        if self.ignored_tokens.contains(mint) {
            return false;
        }
        self.tracked_tokens.is_empty() || self.tracked_tokens.contains(mint)
    }

    fn token_name(&self, mint: &str) -> String {
        self.token_names
            .get(mint)
            .cloned()
            .unwrap_or_else(|| mint.chars().take(8).collect())
    }
}

pub struct SwapFilter {
    settings: RwLock<SwapSettings>,
    recent: RingBuffer<SwapRecord>,
    counters: FilterCounters,
}

impl SwapFilter {
    pub const NAME: &'static str = "swap";

    pub fn new(config: &SwapFilterConfig) -> Self {
        let mut token_names = SwapSettings::default_names();
        token_names.extend(config.token_names.clone());

        info!(
            "Swap filter watching {} smart wallets (min amount {})",
            config.smart_wallets.len(),
            config.min_swap_amount
        );

        Self {
            settings: RwLock::new(SwapSettings {
                smart_wallets: config.smart_wallets.iter().cloned().collect(),
                min_swap_amount: config.min_swap_amount,
                tracked_tokens: config.tracked_tokens.iter().cloned().collect(),
                ignored_tokens: config.ignored_tokens.iter().cloned().collect(),
                token_names,
            }),
            recent: RingBuffer::new(RECENT_CAPACITY),
            counters: FilterCounters::default(),
        }
    }

    pub fn config_update(config: &SwapFilterConfig) -> serde_json::Value {
        serde_json::json!({
            "smart_wallets": config.smart_wallets,
            "min_swap_amount": config.min_swap_amount,
            "tracked_tokens": config.tracked_tokens,
            "ignored_tokens": config.ignored_tokens,
            "token_names": config.token_names,
        })
    }

    /// Recent swaps, newest first
    pub fn recent(&self, max: usize) -> Vec<SwapRecord> {
        self.recent.recent(max)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SwapSettings> {
        self.settings.read().unwrap_or_else(|p| p.into_inner())
    }
}

/// Σpost − Σpre per (owner, mint); a side missing from one list counts as zero
fn token_deltas(tx: &TransactionEvent) -> BTreeMap<(String, String), f64> {
    let mut deltas: BTreeMap<(String, String), f64> = BTreeMap::new();
    for balance in &tx.pre_token_balances {
        *deltas
            .entry((balance.owner.clone(), balance.mint.clone()))
            .or_default() -= balance.ui_amount;
    }
    for balance in &tx.post_token_balances {
        *deltas
            .entry((balance.owner.clone(), balance.mint.clone()))
            .or_default() += balance.ui_amount;
    }
    deltas
}

/// Native SOL moved by `owner`, from lamport balances
fn native_delta(tx: &TransactionEvent, owner: &str) -> Option<f64> {
    let index = tx.account_keys.iter().position(|k| k == owner)?;
    let pre = *tx.pre_balances.get(index)? as i128;
    let post = *tx.post_balances.get(index)? as i128;
    Some((post - pre) as f64 / LAMPORTS_PER_SOL)
}

impl TransactionFilter for SwapFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn counters(&self) -> &FilterCounters {
        &self.counters
    }

    fn evaluate(&self, source_id: &SourceId, tx: &TransactionEvent) -> Result<bool> {
        let deltas = token_deltas(tx);
        let records: Vec<SwapRecord> = {
            let settings = self.read();
            if settings.smart_wallets.is_empty() {
                return Ok(false);
            }

            deltas
                .iter()
                .filter(|((owner, mint), delta)| {
                    settings.smart_wallets.contains(owner)
                        && mint != WSOL_MINT
                        && delta.abs() > DELTA_EPSILON
                        && delta.abs() >= settings.min_swap_amount
                        && settings.wants_mint(mint)
                })
                .map(|((owner, mint), delta)| {
                    let reference = deltas
                        .get(&(owner.clone(), WSOL_MINT.to_string()))
                        .copied()
                        .filter(|d| d.abs() > DELTA_EPSILON)
                        .or_else(|| native_delta(tx, owner))
                        .unwrap_or(0.0);

                    SwapRecord {
                        wallet: owner.clone(),
                        token_mint: mint.clone(),
                        token_name: settings.token_name(mint),
                        token_amount: delta.abs(),
                        sol_amount: reference.abs(),
                        direction: if *delta > 0.0 {
                            SwapDirection::Buy
                        } else {
                            SwapDirection::Sell
                        },
                        signature: tx.signature.clone(),
                        source_id: *source_id,
                        timestamp: Utc::now(),
                    }
                })
                .collect()
        };

        let matched = !records.is_empty();
        for record in records {
            debug!(
                wallet = %record.wallet,
                token = %record.token_name,
                direction = ?record.direction,
                "Smart wallet swap"
            );
            self.recent.push(record);
        }
        Ok(matched)
    }

    fn update_config(&self, json: &str) -> Result<()> {
        let update: SwapUpdate = serde_json::from_str(json).map_err(|e| Error::Filter {
            filter: Self::NAME.to_string(),
            reason: format!("invalid config: {}", e),
        })?;

        if let Some(min) = update.min_swap_amount {
            if !min.is_finite() || min < 0.0 {
                return Err(Error::Filter {
                    filter: Self::NAME.to_string(),
                    reason: format!("min_swap_amount must be non-negative, got {}", min),
                });
            }
        }

        let mut settings = self.settings.write().unwrap_or_else(|p| p.into_inner());
        if let Some(wallets) = update.smart_wallets {
            settings.smart_wallets = wallets.into_iter().collect();
        }
        if let Some(min) = update.min_swap_amount {
            settings.min_swap_amount = min;
        }
        if let Some(tracked) = update.tracked_tokens {
            settings.tracked_tokens = tracked.into_iter().collect();
        }
        if let Some(ignored) = update.ignored_tokens {
            settings.ignored_tokens = ignored.into_iter().collect();
        }
        if let Some(names) = update.token_names {
            let mut merged = SwapSettings::default_names();
            merged.extend(names);
            settings.token_names = merged;
        }

        info!(
            "Swap filter reconfigured: {} smart wallets, min amount {}",
            settings.smart_wallets.len(),
            settings.min_swap_amount
        );
        Ok(())
    }
}
