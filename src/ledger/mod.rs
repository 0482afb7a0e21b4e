//! Ledger network access
//!
//! This module provides:
//! - The `LedgerApi` capability consumed by the coordinator
//! - Wire types for multisig and collectible outputs
//! - An HTTP client with endpoint failover
//! - The raw transaction codec and extra/memo encoding

pub mod codec;
pub mod provider;

pub use codec::{
    script_threshold, AggregatedSignature, ExtraPack, RawInput, RawOutput, RawTransaction,
    EXTRA_SIZE_LIMIT,
};
pub use provider::HttpLedgerClient;

use crate::error::GroupResult;
use crate::model::{Amount, Hash, Stream};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fungible output as reported by the ledger API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultisigUtxo {
    pub utxo_id: String,
    pub asset_id: String,
    pub transaction_hash: Hash,
    pub output_index: u32,
    #[serde(default)]
    pub sender: String,
    pub amount: Amount,
    pub threshold: u8,
    pub members: Vec<String>,
    #[serde(default)]
    pub memo: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub signed_by: String,
    #[serde(default)]
    pub signed_tx: String,
}

/// Non-fungible output as reported by the ledger API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectibleUtxo {
    pub output_id: String,
    pub token_id: String,
    pub transaction_hash: Hash,
    pub output_index: u32,
    pub amount: Amount,
    pub senders_threshold: u8,
    pub senders: Vec<String>,
    pub receivers_threshold: u8,
    pub receivers: Vec<String>,
    #[serde(default)]
    pub memo: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub signed_by: String,
    #[serde(default)]
    pub signed_tx: String,
}

/// Request for one-time destination keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GhostInput {
    pub receivers: Vec<String>,
    pub index: u32,
    pub hint: String,
}

/// Derived one-time keys for a single transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostKeys {
    pub keys: Vec<String>,
    pub mask: String,
}

/// Remote signing round state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub request_id: String,
    /// Hex of the transaction with all signatures collected so far
    pub raw_transaction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransactionStatus {
    pub hash: Hash,
    #[serde(default)]
    pub snapshot: Option<String>,
}

impl RawTransactionStatus {
    pub fn is_confirmed(&self) -> bool {
        self.snapshot.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }
}

/// Remote ledger network consumed by the coordinator
///
/// Every method is a suspension point; implementations must not retry
/// internally beyond endpoint failover, the coordinator owns retry policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn verify_pin(&self, pin: &str) -> GroupResult<()>;

    /// Fungible outputs of the member set updated at or after `offset`, in update order
    async fn read_multisig_outputs(
        &self,
        members: &[String],
        threshold: u8,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> GroupResult<Vec<MultisigUtxo>>;

    async fn read_collectible_outputs(
        &self,
        members: &[String],
        threshold: u8,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleUtxo>>;

    async fn read_ghost_keys(&self, inputs: Vec<GhostInput>) -> GroupResult<Vec<GhostKeys>>;

    /// Open a collective signing round for a raw transaction
    async fn create_sign_request(&self, stream: Stream, raw: &str) -> GroupResult<SignRequest>;

    /// Add this node's partial signature to a round
    async fn sign_request(
        &self,
        stream: Stream,
        request_id: &str,
        pin: &str,
    ) -> GroupResult<SignRequest>;

    async fn send_raw_transaction(&self, raw: &str) -> GroupResult<Hash>;

    async fn get_raw_transaction(&self, hash: Hash) -> GroupResult<RawTransactionStatus>;
}

/// Identify a member set to the ledger API
pub fn hash_members(members: &[String]) -> String {
    let mut sorted = members.to_vec();
    sorted.sort();
    Hash::digest(sorted.join("").as_bytes()).to_string()
}
