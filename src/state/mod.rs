//! Persistent group state over an ordered key-value keyspace
//!
//! Handles:
//! - Output, transaction and action lifecycles with index maintenance
//! - Draining checkpoints and other opaque properties
//! - The membership roster
//!
//! Every method is one atomic write or one consistent read.

pub mod keys;
mod action;
mod iteration;
mod manager;
mod output;
mod transaction;

pub use manager::SqliteStore;
pub use output::OutputRecord;
pub use transaction::TransactionRecord;

use crate::error::GroupResult;
use crate::model::{
    Action, CollectibleOutput, CollectibleTransaction, Iteration, Output, OutputState, Stream,
    Transaction, TransactionState,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage capability consumed by the coordinator
///
/// `limit == 0` means unlimited for every list operation. Lists come back in
/// ascending index time order.
#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> GroupResult<()>;

    async fn read_property(&self, key: &str) -> GroupResult<Option<Vec<u8>>>;
    async fn write_property(&self, key: &str, value: &[u8]) -> GroupResult<()>;

    async fn read_output(&self, output_id: &str) -> GroupResult<Option<Output>>;
    /// Persist a drained output and, atomically, the transaction it belongs to
    async fn write_output(&self, output: &Output, tx: Option<&Transaction>) -> GroupResult<()>;
    /// The only permitted output regression, `Signed -> Unspent`
    async fn reset_output(&self, output: &Output) -> GroupResult<()>;
    async fn list_outputs(&self, state: OutputState, limit: usize) -> GroupResult<Vec<Output>>;
    async fn list_outputs_for_asset(
        &self,
        asset_id: &str,
        state: OutputState,
        limit: usize,
    ) -> GroupResult<Vec<Output>>;
    async fn list_outputs_for_transaction(&self, trace_id: &str) -> GroupResult<Vec<Output>>;

    async fn read_transaction(&self, trace_id: &str) -> GroupResult<Option<Transaction>>;
    async fn write_transaction(&self, tx: &Transaction) -> GroupResult<()>;
    /// Move an `Initial` transaction to the tail of its queue
    async fn requeue_transaction(&self, trace_id: &str, at: DateTime<Utc>) -> GroupResult<()>;
    /// Commit a signing round: inputs become `Signed` and the transaction `Signing`
    async fn write_signed_round(&self, outputs: &[Output], tx: &Transaction) -> GroupResult<()>;
    /// The only permitted transaction regression, `Signing -> Initial`
    async fn reset_transaction(&self, trace_id: &str) -> GroupResult<()>;
    async fn list_transactions(
        &self,
        state: TransactionState,
        limit: usize,
    ) -> GroupResult<Vec<Transaction>>;

    async fn read_collectible_output(&self, output_id: &str)
        -> GroupResult<Option<CollectibleOutput>>;
    async fn write_collectible_output(
        &self,
        output: &CollectibleOutput,
        tx: Option<&CollectibleTransaction>,
    ) -> GroupResult<()>;
    async fn reset_collectible_output(&self, output: &CollectibleOutput) -> GroupResult<()>;
    async fn list_collectible_outputs(
        &self,
        state: OutputState,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleOutput>>;
    async fn list_collectible_outputs_for_token(
        &self,
        token_id: &str,
        state: OutputState,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleOutput>>;
    async fn list_collectible_outputs_for_transaction(
        &self,
        trace_id: &str,
    ) -> GroupResult<Vec<CollectibleOutput>>;

    async fn read_collectible_transaction(
        &self,
        trace_id: &str,
    ) -> GroupResult<Option<CollectibleTransaction>>;
    async fn write_collectible_transaction(&self, tx: &CollectibleTransaction) -> GroupResult<()>;
    async fn requeue_collectible_transaction(
        &self,
        trace_id: &str,
        at: DateTime<Utc>,
    ) -> GroupResult<()>;
    async fn write_signed_collectible_round(
        &self,
        outputs: &[CollectibleOutput],
        tx: &CollectibleTransaction,
    ) -> GroupResult<()>;
    async fn reset_collectible_transaction(&self, trace_id: &str) -> GroupResult<()>;
    async fn list_collectible_transactions(
        &self,
        state: TransactionState,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleTransaction>>;

    /// Number of transactions of either stream in `state`
    async fn count_transactions(&self, stream: Stream, state: TransactionState) -> GroupResult<u64>;

    /// Queue an action unless its originating transaction was already seen;
    /// returns whether a new action was written
    async fn write_action(&self, stream: Stream, action: &Action) -> GroupResult<bool>;
    /// Pending actions in output creation order
    async fn list_actions(&self, stream: Stream, limit: usize) -> GroupResult<Vec<Action>>;
    async fn list_action_workers(&self, stream: Stream, output_id: &str)
        -> GroupResult<Vec<String>>;
    async fn mark_action_worker(&self, stream: Stream, output_id: &str, worker: &str)
        -> GroupResult<()>;
    /// Mark an action done and drop its worker markers
    async fn finish_action(&self, stream: Stream, output_id: &str) -> GroupResult<()>;

    /// Record a roster event; older or equal events for the same node are ignored
    async fn write_iteration(&self, iteration: &Iteration) -> GroupResult<bool>;
    async fn list_iterations(&self) -> GroupResult<Vec<Iteration>>;
}
