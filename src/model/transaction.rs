//! Outgoing transfers requested by workers or co-signed for other members

use super::{Amount, Hash};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Initial = 10,
    Signing = 11,
    Signed = 12,
    /// Confirmed by the ledger, terminal
    Snapshot = 13,
}

impl TransactionState {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Initial => "initial",
            TransactionState::Signing => "signing",
            TransactionState::Signed => "signed",
            TransactionState::Snapshot => "snapshot",
        }
    }

    pub fn all() -> [TransactionState; 4] {
        [
            TransactionState::Initial,
            TransactionState::Signing,
            TransactionState::Signed,
            TransactionState::Snapshot,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Idempotency key, at most one logical transfer per trace id
    pub trace_id: String,
    pub group_id: String,
    pub asset_id: String,
    pub receivers: Vec<String>,
    pub threshold: u8,
    pub amount: Amount,
    pub memo: String,
    pub state: TransactionState,
    pub raw: Vec<u8>,
    pub hash: Option<Hash>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Carry the request fields of `self` forward into a later round observed on the ledger
    pub fn advance_with(&self, observed: &Transaction) -> Transaction {
        Transaction {
            state: observed.state,
            raw: observed.raw.clone(),
            hash: observed.hash,
            updated_at: observed.updated_at,
            ..self.clone()
        }
    }
}
