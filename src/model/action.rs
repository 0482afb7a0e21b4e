//! Per-output work items offered to every worker once

use super::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActionState {
    Initial = 10,
    Done = 11,
}

impl ActionState {
    pub fn name(&self) -> &'static str {
        match self {
            ActionState::Initial => "initial",
            ActionState::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub output_id: String,
    /// Originating ledger transaction of the output
    pub transaction_hash: Hash,
    /// Ledger creation time of the output, the queue ordering key
    pub created_at: DateTime<Utc>,
    pub state: ActionState,
}

impl Action {
    pub fn new(output_id: &str, transaction_hash: Hash, created_at: DateTime<Utc>) -> Self {
        Self {
            output_id: output_id.to_string(),
            transaction_hash,
            created_at,
            state: ActionState::Initial,
        }
    }
}
