//! Fungible group outputs mirrored from the ledger

use super::{parse_output_state, Amount, Hash};
use crate::error::GroupResult;
use crate::ledger::MultisigUtxo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OutputState {
    Unspent = 10,
    Signed = 11,
    Spent = 12,
}

impl OutputState {
    /// Index discriminant
    pub fn name(&self) -> &'static str {
        match self {
            OutputState::Unspent => "unspent",
            OutputState::Signed => "signed",
            OutputState::Spent => "spent",
        }
    }
}

/// A claim on value held by the group, one per ledger UTXO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub output_id: String,
    pub group_id: String,
    pub asset_id: String,
    pub transaction_hash: Hash,
    pub output_index: u32,
    pub sender: String,
    pub amount: Amount,
    pub threshold: u8,
    pub members: Vec<String>,
    pub memo: String,
    pub state: OutputState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Payload hash of the transaction spending this output, once signed
    pub signed_by: String,
    /// Hex of the signed spending transaction, once signed
    pub signed_tx: String,
    /// Trace id of the local transaction this output is committed to
    pub trace_id: Option<String>,
}

impl Output {
    pub fn from_multisig(utxo: MultisigUtxo) -> GroupResult<Self> {
        let state = parse_output_state(&utxo.state)?;
        Ok(Self {
            output_id: utxo.utxo_id,
            group_id: String::new(),
            asset_id: utxo.asset_id,
            transaction_hash: utxo.transaction_hash,
            output_index: utxo.output_index,
            sender: utxo.sender,
            amount: utxo.amount,
            threshold: utxo.threshold,
            members: utxo.members,
            memo: utxo.memo,
            state,
            created_at: utxo.created_at,
            updated_at: utxo.updated_at,
            signed_by: utxo.signed_by,
            signed_tx: utxo.signed_tx,
            trace_id: None,
        })
    }

    /// Dedup key for one ledger update of this output
    pub fn update_key(&self) -> String {
        format!(
            "OUT:{}:{}",
            self.output_id,
            self.updated_at.timestamp_nanos_opt().unwrap_or_default()
        )
    }

    /// Clear signing data after an abandoned round
    pub fn reset_to_unspent(&mut self) {
        self.state = OutputState::Unspent;
        self.signed_by.clear();
        self.signed_tx.clear();
        self.trace_id = None;
    }
}
