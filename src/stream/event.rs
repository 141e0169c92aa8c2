//! Transaction events as seen by filters, storage and the HTTP surface

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};
use yellowstone_grpc_proto::prelude::{SubscribeUpdateTransaction, TokenBalance};

/// Opaque handle for a registered data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Uuid);

impl SourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compiled instruction with indices into `account_keys`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionRef {
    pub program_id_index: u32,
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenBalanceEntry {
    pub account_index: u32,
    pub owner: String,
    pub mint: String,
    pub ui_amount: f64,
    pub decimals: u32,
}

/// One transaction update received from a data source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionEvent {
    pub signature: String,
    pub slot: u64,
    /// Upstream update re-encoded as protobuf, persisted as-is
    pub payload: Vec<u8>,
    /// Static keys followed by lookup-table loaded writable then readonly keys
    pub account_keys: Vec<String>,
    pub instructions: Vec<InstructionRef>,
    pub pre_token_balances: Vec<TokenBalanceEntry>,
    pub post_token_balances: Vec<TokenBalanceEntry>,
    /// Native lamport balances, indexed like `account_keys`
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
}

impl TransactionEvent {
    pub fn account_key(&self, index: usize) -> Option<&str> {
        self.account_keys.get(index).map(String::as_str)
    }

    /// Storage key for this event
    pub fn storage_key(&self) -> Vec<u8> {
        self.signature.as_bytes().to_vec()
    }

    /// Build an event from a Geyser transaction update
    pub fn from_update(update: &SubscribeUpdateTransaction, payload: Vec<u8>) -> Result<Self> {
        let info = update
            .transaction
            .as_ref()
            .ok_or_else(|| Error::MalformedUpdate("transaction info missing".to_string()))?;

        if info.signature.is_empty() {
            return Err(Error::MalformedUpdate("empty signature".to_string()));
        }
        let signature = bs58::encode(&info.signature).into_string();

        let mut account_keys = Vec::new();
        let mut instructions = Vec::new();
        if let Some(message) = info.transaction.as_ref().and_then(|tx| tx.message.as_ref()) {
            account_keys.extend(message.account_keys.iter().map(|k| bs58::encode(k).into_string()));
            instructions.extend(message.instructions.iter().map(|ix| InstructionRef {
                program_id_index: ix.program_id_index,
                accounts: ix.accounts.clone(),
                data: ix.data.clone(),
            }));
        }

        let mut event = TransactionEvent {
            signature,
            slot: update.slot,
            payload,
            account_keys,
            instructions,
            ..Default::default()
        };

        if let Some(meta) = info.meta.as_ref() {
            event.account_keys.extend(
                meta.loaded_writable_addresses
                    .iter()
                    .chain(meta.loaded_readonly_addresses.iter())
                    .map(|k| bs58::encode(k).into_string()),
            );
            event.pre_token_balances = meta.pre_token_balances.iter().map(convert_balance).collect();
            event.post_token_balances = meta.post_token_balances.iter().map(convert_balance).collect();
            event.pre_balances = meta.pre_balances.clone();
            event.post_balances = meta.post_balances.clone();
        }

        Ok(event)
    }
}

fn convert_balance(balance: &TokenBalance) -> TokenBalanceEntry {
    let (ui_amount, decimals) = balance
        .ui_token_amount
        .as_ref()
        .map(|amount| (amount.ui_amount, amount.decimals))
        .unwrap_or((0.0, 0));

    TokenBalanceEntry {
        account_index: balance.account_index,
        owner: balance.owner.clone(),
        mint: balance.mint.clone(),
        ui_amount,
        decimals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yellowstone_grpc_proto::prelude::{
        CompiledInstruction, Message, SubscribeUpdateTransactionInfo, Transaction,
        TransactionStatusMeta, UiTokenAmount,
    };

    #[test]
    fn test_from_update_resolves_keys_and_balances() {
        let sig = vec![7u8; 64];
        let update = SubscribeUpdateTransaction {
            slot: 42,
            transaction: Some(SubscribeUpdateTransactionInfo {
                signature: sig.clone(),
                transaction: Some(Transaction {
                    signatures: vec![sig.clone()],
                    message: Some(Message {
                        account_keys: vec![vec![1u8; 32], vec![2u8; 32]],
                        instructions: vec![CompiledInstruction {
                            program_id_index: 1,
                            accounts: vec![0, 2],
                            data: vec![9],
                        }],
                        ..Default::default()
                    }),
                }),
                meta: Some(TransactionStatusMeta {
                    loaded_writable_addresses: vec![vec![3u8; 32]],
                    pre_balances: vec![10, 20, 30],
                    post_balances: vec![5, 20, 30],
                    post_token_balances: vec![TokenBalance {
                        account_index: 2,
                        mint: "mint".into(),
                        owner: "owner".into(),
                        ui_token_amount: Some(UiTokenAmount {
                            ui_amount: 4.5,
                            decimals: 6,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };

        let event = TransactionEvent::from_update(&update, vec![0xaa]).unwrap();
        assert_eq!(event.signature, bs58::encode(&sig).into_string());
        assert_eq!(event.slot, 42);
        assert_eq!(event.account_keys.len(), 3);
        assert_eq!(event.account_key(2), Some(bs58::encode([3u8; 32]).into_string().as_str()));
        assert_eq!(event.instructions[0].program_id_index, 1);
        assert_eq!(event.post_token_balances[0].ui_amount, 4.5);
        assert!(event.pre_token_balances.is_empty());
        assert_eq!(event.payload, vec![0xaa]);
    }

    #[test]
    fn test_from_update_requires_transaction() {
        let update = SubscribeUpdateTransaction {
            slot: 1,
            transaction: None,
        };
        assert!(matches!(
            TransactionEvent::from_update(&update, vec![]),
            Err(Error::MalformedUpdate(_))
        ));
    }
}
