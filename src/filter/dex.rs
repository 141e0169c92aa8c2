//! DEX program matching
//!
//! Flags transactions that invoke a known DEX program and keeps the most
//! recent matches for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

use super::ring::{RingBuffer, RECENT_CAPACITY};
use super::types::{FilterCounters, TransactionFilter};
use crate::config::DexFilterConfig;
use crate::error::{Error, Result};
use crate::stream::{SourceId, TransactionEvent};

pub const RAYDIUM_AMM_V4: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";
pub const PUMP_FUN: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

const UNKNOWN_DEX: &str = "Unknown DEX";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DexMatch {
    pub signature: String,
    pub source_id: SourceId,
    pub dex_program: String,
    pub dex_name: String,
    pub accounts: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Hot-reloadable settings, keyed the way `update_config` receives them
#[derive(Debug, Default, Deserialize)]
struct DexUpdate {
    dex_programs: Option<Vec<String>>,
    dex_names: Option<HashMap<String, String>>,
}

#[derive(Debug)]
struct DexSettings {
    programs: HashSet<String>,
    names: HashMap<String, String>,
}

impl DexSettings {
    fn builtin_names() -> HashMap<String, String> {
        HashMap::from([
            (RAYDIUM_AMM_V4.to_string(), "Raydium".to_string()),
            (PUMP_FUN.to_string(), "Pump.fun".to_string()),
        ])
    }

    fn resolve_name(&self, program: &str) -> String {
        self.names
            .get(program)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_DEX.to_string())
    }
}

pub struct DexFilter {
    settings: RwLock<DexSettings>,
    recent: RingBuffer<DexMatch>,
    counters: FilterCounters,
}

impl DexFilter {
    pub const NAME: &'static str = "dex";

    pub fn new(config: &DexFilterConfig) -> Self {
        let mut names = DexSettings::builtin_names();
        names.extend(config.names.clone());

        let programs: HashSet<String> = if config.programs.is_empty() {
            names.keys().cloned().collect()
        } else {
            config.programs.iter().cloned().collect()
        };

        info!("DEX filter watching {} programs", programs.len());

        Self {
            settings: RwLock::new(DexSettings { programs, names }),
            recent: RingBuffer::new(RECENT_CAPACITY),
            counters: FilterCounters::default(),
        }
    }

    /// JSON accepted by `update_config` for a given config section
    pub fn config_update(config: &DexFilterConfig) -> serde_json::Value {
        serde_json::json!({
            "dex_names": config.names,
            "dex_programs": config.programs,
        })
    }

    /// Recent matches, newest first
    pub fn recent(&self, max: usize) -> Vec<DexMatch> {
        self.recent.recent(max)
    }

    pub fn programs(&self) -> Vec<String> {
        let mut programs: Vec<String> = self.read().programs.iter().cloned().collect();
        programs.sort();
        programs
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DexSettings> {
        self.settings.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl TransactionFilter for DexFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn counters(&self) -> &FilterCounters {
        &self.counters
    }

    fn evaluate(&self, source_id: &SourceId, tx: &TransactionEvent) -> Result<bool> {
        let found = {
            let settings = self.read();
            tx.instructions.iter().find_map(|ix| {
                let program = tx.account_key(ix.program_id_index as usize)?;
                if !settings.programs.contains(program) {
                    return None;
                }
                let accounts = ix
                    .accounts
                    .iter()
                    .filter_map(|&idx| tx.account_key(idx as usize).map(str::to_string))
                    .collect::<Vec<_>>();
                Some((program.to_string(), settings.resolve_name(program), accounts))
            })
        };

        let Some((dex_program, dex_name, accounts)) = found else {
            return Ok(false);
        };

        debug!(signature = %tx.signature, dex = %dex_name, "DEX match");
        self.recent.push(DexMatch {
            signature: tx.signature.clone(),
            source_id: *source_id,
            dex_program,
            dex_name,
            accounts,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    fn update_config(&self, json: &str) -> Result<()> {
        let update: DexUpdate = serde_json::from_str(json).map_err(|e| Error::Filter {
            filter: Self::NAME.to_string(),
            reason: format!("invalid config: {}", e),
        })?;

        let mut settings = self.settings.write().unwrap_or_else(|p| p.into_inner());
        if let Some(names) = update.dex_names {
            let mut merged = DexSettings::builtin_names();
            merged.extend(names);
            settings.names = merged;
        }
        // An empty list means every known program, as at construction
        if let Some(programs) = update.dex_programs {
            settings.programs = if programs.is_empty() {
                settings.names.keys().cloned().collect()
            } else {
                programs.into_iter().collect()
            };
        }

        info!("DEX filter reconfigured: {} programs", settings.programs.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::InstructionRef;

    const ORCA: &str = "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc";

    fn tx_invoking(program: &str) -> TransactionEvent {
        TransactionEvent {
            signature: "sig".into(),
            account_keys: vec!["payer".into(), program.into(), "pool".into()],
            instructions: vec![InstructionRef {
                program_id_index: 1,
                accounts: vec![0, 2, 9],
                data: vec![],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_builtin_program_matches_with_name() {
        let filter = DexFilter::new(&DexFilterConfig::default());
        let source = SourceId::new();

        assert!(filter.process_transaction(&source, &tx_invoking(RAYDIUM_AMM_V4)).unwrap());

        let recent = filter.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].dex_name, "Raydium");
        assert_eq!(recent[0].source_id, source);
        // Out-of-range account index 9 is skipped
        assert_eq!(recent[0].accounts, vec!["payer".to_string(), "pool".to_string()]);
    }

    #[test]
    fn test_reconfigure_adds_program() {
        let filter = DexFilter::new(&DexFilterConfig::default());
        let source = SourceId::new();
        let tx = tx_invoking(ORCA);

        assert!(!filter.process_transaction(&source, &tx).unwrap());
        assert!(filter.recent(10).is_empty());

        filter
            .update_config(&format!(r#"{{"dex_programs": ["{ORCA}"]}}"#))
            .unwrap();
        assert!(filter.process_transaction(&source, &tx).unwrap());

        let recent = filter.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].dex_program, ORCA);
        assert_eq!(recent[0].dex_name, UNKNOWN_DEX);
        assert_eq!(filter.counters().processed(), 2);
        assert_eq!(filter.counters().matched(), 1);
    }

    #[test]
    fn test_only_first_matching_instruction_is_recorded() {
        let filter = DexFilter::new(&DexFilterConfig::default());
        let mut tx = tx_invoking(RAYDIUM_AMM_V4);
        tx.account_keys.push(PUMP_FUN.into());
        tx.instructions.push(InstructionRef {
            program_id_index: 3,
            accounts: vec![],
            data: vec![],
        });
        // Program index past the key list is ignored
        tx.instructions.insert(
            0,
            InstructionRef {
                program_id_index: 42,
                accounts: vec![],
                data: vec![],
            },
        );

        assert!(filter.process_transaction(&SourceId::new(), &tx).unwrap());
        let recent = filter.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].dex_program, RAYDIUM_AMM_V4);
    }

    #[test]
    fn test_config_names_and_bad_json() {
        let mut config = DexFilterConfig::default();
        config.programs = vec![ORCA.into()];
        config.names.insert(ORCA.into(), "Orca".into());
        let filter = DexFilter::new(&config);

        assert_eq!(filter.programs(), vec![ORCA.to_string()]);
        assert!(filter.process_transaction(&SourceId::new(), &tx_invoking(ORCA)).unwrap());
        assert_eq!(filter.recent(1)[0].dex_name, "Orca");

        assert!(filter.update_config("not json").is_err());
        let update = DexFilter::config_update(&config);
        assert!(filter.update_config(&update.to_string()).is_ok());
    }

    #[test]
    fn test_reload_clearing_programs_restores_builtins() {
        let mut config = DexFilterConfig::default();
        config.programs = vec![ORCA.into()];
        let filter = DexFilter::new(&config);
        assert_eq!(filter.programs(), vec![ORCA.to_string()]);

        config.programs.clear();
        let update = DexFilter::config_update(&config);
        assert_eq!(update["dex_programs"], serde_json::json!([]));
        filter.update_config(&update.to_string()).unwrap();

        let builtins = DexFilter::new(&DexFilterConfig::default()).programs();
        assert_eq!(filter.programs(), builtins);
        assert!(filter.programs().contains(&RAYDIUM_AMM_V4.to_string()));
        let source = SourceId::new();
        assert!(!filter.process_transaction(&source, &tx_invoking(ORCA)).unwrap());
        assert!(filter.process_transaction(&source, &tx_invoking(PUMP_FUN)).unwrap());
    }
}
