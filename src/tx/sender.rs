//! Publishing of signed transactions

use crate::coordination::Group;
use crate::error::GroupResult;
use crate::model::{CollectibleTransaction, Stream, Transaction, TransactionState};

use tracing::{debug, info};

impl Group {
    /// Broadcast every `Signed` transaction and confirm the snapshotted ones
    pub(crate) async fn publish_transactions(&self) -> GroupResult<()> {
        for tx in self.store.list_transactions(TransactionState::Signed, 0).await? {
            if self.is_stopped().await {
                break;
            }
            if !self.snapshot_transaction(&tx.raw).await? {
                debug!(trace_id = %tx.trace_id, "Transaction awaiting snapshot");
                continue;
            }
            let done = Transaction {
                state: TransactionState::Snapshot,
                ..tx
            };
            self.store.write_transaction(&done).await?;
            crate::metrics::record_transaction_published(Stream::Multisig);
            info!(trace_id = %done.trace_id, "Transaction confirmed");
        }
        Ok(())
    }

    pub(crate) async fn publish_collectible_transactions(&self) -> GroupResult<()> {
        let txs = self
            .store
            .list_collectible_transactions(TransactionState::Signed, 0)
            .await?;
        for tx in txs {
            if self.is_stopped().await {
                break;
            }
            if !self.snapshot_transaction(&tx.raw).await? {
                debug!(trace_id = %tx.trace_id, "Collectible transaction awaiting snapshot");
                continue;
            }
            let done = CollectibleTransaction {
                state: TransactionState::Snapshot,
                ..tx
            };
            self.store.write_collectible_transaction(&done).await?;
            crate::metrics::record_transaction_published(Stream::Collectible);
            info!(trace_id = %done.trace_id, "Collectible transaction confirmed");
        }
        Ok(())
    }

    /// Broadcast `raw`; true once the ledger reports a snapshot for it
    ///
    /// Broadcasting an already known transaction is harmless.
    async fn snapshot_transaction(&self, raw: &[u8]) -> GroupResult<bool> {
        let hex = hex::encode(raw);
        let hash = self.ledger.send_raw_transaction(&hex).await?;
        debug!(hash = %hash, "Broadcast raw transaction");
        let status = self.ledger.get_raw_transaction(hash).await?;
        Ok(status.is_confirmed())
    }
}
