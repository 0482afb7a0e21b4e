//! Non-fungible twins of [`Output`](super::Output) and [`Transaction`](super::Transaction)

use super::{parse_output_state, Amount, Hash, OutputState, TransactionState};
use crate::error::GroupResult;
use crate::ledger::CollectibleUtxo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token id of the carrier outputs consumed by mint transactions
pub const COLLECTIBLE_META_TOKEN_ID: &str = "2f8aa18a-3cb8-31d5-95bc-5a4f2e25dc2f";

/// Ledger asset all collectible transactions are denominated in
pub const COLLECTIBLE_ASSET_ID: &str =
    "1700941284a95f31b25ec8c546008f208f88eee4419ccdcdbe6e3195e60128ca";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectibleOutput {
    pub output_id: String,
    pub token_id: String,
    pub transaction_hash: Hash,
    pub output_index: u32,
    pub amount: Amount,
    pub senders_threshold: u8,
    pub senders: Vec<String>,
    pub receivers_threshold: u8,
    pub receivers: Vec<String>,
    pub memo: String,
    pub state: OutputState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub signed_by: String,
    pub signed_tx: String,
    pub trace_id: Option<String>,
}

impl CollectibleOutput {
    pub fn from_collectible(utxo: CollectibleUtxo) -> GroupResult<Self> {
        let state = parse_output_state(&utxo.state)?;
        Ok(Self {
            output_id: utxo.output_id,
            token_id: utxo.token_id,
            transaction_hash: utxo.transaction_hash,
            output_index: utxo.output_index,
            amount: utxo.amount,
            senders_threshold: utxo.senders_threshold,
            senders: utxo.senders,
            receivers_threshold: utxo.receivers_threshold,
            receivers: utxo.receivers,
            memo: utxo.memo,
            state,
            created_at: utxo.created_at,
            updated_at: utxo.updated_at,
            signed_by: utxo.signed_by,
            signed_tx: utxo.signed_tx,
            trace_id: None,
        })
    }

    pub fn update_key(&self) -> String {
        format!(
            "NFT:{}:{}",
            self.output_id,
            self.updated_at.timestamp_nanos_opt().unwrap_or_default()
        )
    }

    pub fn reset_to_unspent(&mut self) {
        self.state = OutputState::Unspent;
        self.signed_by.clear();
        self.signed_tx.clear();
        self.trace_id = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectibleTransaction {
    pub trace_id: String,
    pub state: TransactionState,
    pub receivers: Vec<String>,
    pub threshold: u8,
    pub amount: Amount,
    /// Non-fungible payload carried in the transaction extra
    pub nfo: Vec<u8>,
    pub raw: Vec<u8>,
    pub hash: Option<Hash>,
    pub updated_at: DateTime<Utc>,
}

impl CollectibleTransaction {
    pub fn advance_with(&self, observed: &CollectibleTransaction) -> CollectibleTransaction {
        CollectibleTransaction {
            state: observed.state,
            raw: observed.raw.clone(),
            hash: observed.hash,
            updated_at: observed.updated_at,
            ..self.clone()
        }
    }
}

/// Trace id of a mint, derived from the content hash of its payload
pub fn nfo_trace_id(nfo: &[u8]) -> String {
    let nid = Hash::digest(nfo).to_string();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, nid.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nfo_trace_id_is_content_addressed() {
        let a = nfo_trace_id(b"collection:token:1");
        assert_eq!(a, nfo_trace_id(b"collection:token:1"));
        assert_ne!(a, nfo_trace_id(b"collection:token:2"));
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
