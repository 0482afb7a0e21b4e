//! Transaction rows, their state queue and payload hash index

use super::keys::Keyspace;
use super::manager::{get_entity, index_id, kv_delete, kv_put, kv_scan, put_entity};
use super::output::{self, OutputRecord};
use crate::error::{GroupError, GroupResult};
use crate::model::{CollectibleTransaction, Hash, Transaction, TransactionState};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::info;

/// Common shape of fungible and collectible transactions
pub trait TransactionRecord: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn trace_id(&self) -> &str;
    fn state(&self) -> TransactionState;
    fn hash(&self) -> Option<Hash>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_updated_at(&mut self, at: DateTime<Utc>);
    /// Carry local request fields forward into a round observed on the ledger
    fn advance(&self, observed: &Self) -> Self;
    /// Forget the signing round so the transaction is rebuilt from scratch
    fn reset_to_initial(&mut self);
}

impl TransactionRecord for Transaction {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn hash(&self) -> Option<Hash> {
        self.hash
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn advance(&self, observed: &Self) -> Self {
        self.advance_with(observed)
    }

    fn reset_to_initial(&mut self) {
        self.state = TransactionState::Initial;
        self.raw.clear();
        self.hash = None;
    }
}

impl TransactionRecord for CollectibleTransaction {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn hash(&self) -> Option<Hash> {
        self.hash
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn advance(&self, observed: &Self) -> Self {
        self.advance_with(observed)
    }

    fn reset_to_initial(&mut self) {
        self.state = TransactionState::Initial;
        self.raw.clear();
        self.hash = None;
    }
}

pub(super) async fn read_transaction<T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    trace_id: &str,
) -> GroupResult<Option<T>> {
    get_entity(conn, &ks.transaction_payload(trace_id)).await
}

async fn replace<T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    old: Option<&T>,
    tx: &T,
) -> GroupResult<()> {
    if let Some(old) = old {
        kv_delete(conn, &ks.transaction_state(old.state(), old.updated_at(), old.trace_id()))
            .await?;
        if let Some(hash) = old.hash().filter(|h| Some(*h) != tx.hash()) {
            kv_delete(conn, &ks.transaction_hash(&hash)).await?;
        }
    }

    let trace_id = tx.trace_id().as_bytes();
    put_entity(conn, &ks.transaction_payload(tx.trace_id()), tx).await?;
    kv_put(
        conn,
        &ks.transaction_state(tx.state(), tx.updated_at(), tx.trace_id()),
        trace_id,
    )
    .await?;
    if let Some(hash) = tx.hash() {
        kv_put(conn, &ks.transaction_hash(&hash), trace_id).await?;
    }
    Ok(())
}

/// Upsert a transaction following its lifecycle
///
/// Equal state is a no-op and a lower state is fatal.
pub(super) async fn write_transaction<T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    tx: &T,
) -> GroupResult<bool> {
    let old: Option<T> = read_transaction(conn, ks, tx.trace_id()).await?;
    if let Some(old) = &old {
        if old.state() == tx.state() {
            return Ok(false);
        }
        if old.state() > tx.state() {
            return Err(GroupError::fatal(format!(
                "transaction {} state regression {} -> {}",
                tx.trace_id(),
                old.state().name(),
                tx.state().name()
            )));
        }
    }
    replace(conn, ks, old.as_ref(), tx).await?;
    Ok(true)
}

pub(super) async fn requeue_transaction<T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    trace_id: &str,
    at: DateTime<Utc>,
) -> GroupResult<bool> {
    let old: Option<T> = read_transaction(conn, ks, trace_id).await?;
    let Some(old) = old.filter(|tx| tx.state() == TransactionState::Initial) else {
        return Ok(false);
    };
    let mut tx = old.clone();
    tx.set_updated_at(at);
    replace(conn, ks, Some(&old), &tx).await?;
    Ok(true)
}

/// Persist a drained output together with the transaction it reveals
///
/// A local transaction already at or past the observed state is left alone, a
/// lagging one advances while keeping its request fields.
pub(super) async fn write_drained<O: OutputRecord, T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    out: &O,
    observed: Option<&T>,
) -> GroupResult<()> {
    output::write_output(conn, ks, out).await?;
    let Some(observed) = observed else {
        return Ok(());
    };

    let old: Option<T> = read_transaction(conn, ks, observed.trace_id()).await?;
    match old {
        Some(old) if old.state() >= observed.state() => Ok(()),
        Some(old) => write_transaction(conn, ks, &old.advance(observed)).await.map(|_| ()),
        None => write_transaction(conn, ks, observed).await.map(|_| ()),
    }
}

pub(super) async fn write_signed_round<O: OutputRecord, T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    outputs: &[O],
    tx: &T,
) -> GroupResult<()> {
    if tx.state() != TransactionState::Signing {
        return Err(GroupError::fatal(format!(
            "transaction {} committed as {}",
            tx.trace_id(),
            tx.state().name()
        )));
    }
    for out in outputs {
        if out.trace_id() != Some(tx.trace_id()) {
            return Err(GroupError::fatal(format!(
                "output {} not linked to {}",
                out.id(),
                tx.trace_id()
            )));
        }
        output::write_output(conn, ks, out).await?;
    }
    write_transaction(conn, ks, tx).await?;
    Ok(())
}

/// `Signing -> Initial`, dropping every output link of the transaction
pub(super) async fn reset_transaction<O: OutputRecord, T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    trace_id: &str,
) -> GroupResult<bool> {
    let old: Option<T> = read_transaction(conn, ks, trace_id).await?;
    let Some(old) = old else {
        return Err(GroupError::fatal(format!("reset of unknown transaction {}", trace_id)));
    };
    match old.state() {
        TransactionState::Initial => return Ok(false),
        TransactionState::Signing => {}
        state => {
            return Err(GroupError::fatal(format!(
                "transaction {} reset from {}",
                trace_id,
                state.name()
            )))
        }
    }

    let mut tx = old.clone();
    tx.reset_to_initial();
    replace(conn, ks, Some(&old), &tx).await?;
    let unlinked = output::unlink_outputs::<O>(conn, ks, trace_id).await?;
    info!(trace_id, unlinked, "Transaction reset to initial");
    Ok(true)
}

pub(super) async fn list_transactions<T: TransactionRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    state: TransactionState,
    limit: usize,
) -> GroupResult<Vec<T>> {
    let rows = kv_scan(conn, &ks.transaction_state_prefix(state), limit).await?;
    let mut txs = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        let trace_id = index_id(&key, value)?;
        let tx = read_transaction(conn, ks, &trace_id).await?.ok_or_else(|| {
            GroupError::fatal(format!(
                "dangling transaction index {}",
                String::from_utf8_lossy(&key)
            ))
        })?;
        txs.push(tx);
    }
    Ok(txs)
}

#[cfg(test)]
mod tests {
    use crate::model::{
        Amount, Hash, Output, OutputState, Stream, Transaction, TransactionState,
    };
    use crate::state::{SqliteStore, Store};
    use chrono::{Duration, TimeZone, Utc};

    const TRACE: &str = "7b0c5b1e-2f64-4b7a-9c0d-1e2f3a4b5c6d";

    fn transaction(state: TransactionState) -> Transaction {
        Transaction {
            trace_id: TRACE.to_string(),
            group_id: String::new(),
            asset_id: "x".to_string(),
            receivers: vec!["r".to_string()],
            threshold: 1,
            amount: Amount::from_units(600_000_000),
            memo: "memo".to_string(),
            state,
            raw: Vec::new(),
            hash: None,
            updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn linked_output(id: &str) -> Output {
        let ts = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        Output {
            output_id: id.to_string(),
            group_id: String::new(),
            asset_id: "x".to_string(),
            transaction_hash: Hash::digest(id.as_bytes()),
            output_index: 0,
            sender: String::new(),
            amount: Amount::from_units(1_000_000_000),
            threshold: 2,
            members: vec![],
            memo: String::new(),
            state: OutputState::Signed,
            created_at: ts,
            updated_at: ts,
            signed_by: "payload".to_string(),
            signed_tx: "00".to_string(),
            trace_id: Some(TRACE.to_string()),
        }
    }

    fn signing() -> Transaction {
        let mut tx = transaction(TransactionState::Signing);
        tx.raw = vec![1, 2, 3];
        tx.hash = Some(Hash::digest(b"raw"));
        tx
    }

    #[tokio::test]
    async fn test_lifecycle_moves_state_index() {
        let store = SqliteStore::memory().await;
        store.write_transaction(&transaction(TransactionState::Initial)).await.unwrap();
        assert_eq!(store.list_transactions(TransactionState::Initial, 0).await.unwrap().len(), 1);

        store.write_transaction(&signing()).await.unwrap();
        assert!(store.list_transactions(TransactionState::Initial, 0).await.unwrap().is_empty());
        assert_eq!(store.count_transactions(Stream::Multisig, TransactionState::Signing).await.unwrap(), 1);

        let err = store
            .write_transaction(&transaction(TransactionState::Initial))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_same_trace_written_once() {
        let store = SqliteStore::memory().await;
        store.write_transaction(&transaction(TransactionState::Initial)).await.unwrap();

        let mut other = transaction(TransactionState::Initial);
        other.amount = Amount::from_units(1);
        store.write_transaction(&other).await.unwrap();

        let stored = store.read_transaction(TRACE).await.unwrap().unwrap();
        assert_eq!(stored.amount, Amount::from_units(600_000_000));
        assert_eq!(store.list_transactions(TransactionState::Initial, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_signed_round_and_reset() {
        let store = SqliteStore::memory().await;
        let mut unspent = linked_output("o1");
        unspent.state = OutputState::Unspent;
        unspent.signed_by.clear();
        unspent.signed_tx.clear();
        unspent.trace_id = None;
        store.write_output(&unspent, None).await.unwrap();
        store.write_transaction(&transaction(TransactionState::Initial)).await.unwrap();

        store.write_signed_round(&[linked_output("o1")], &signing()).await.unwrap();
        assert_eq!(store.list_outputs_for_transaction(TRACE).await.unwrap().len(), 1);

        store.reset_transaction(TRACE).await.unwrap();
        let tx = store.read_transaction(TRACE).await.unwrap().unwrap();
        assert_eq!(tx.state, TransactionState::Initial);
        assert!(tx.raw.is_empty() && tx.hash.is_none());
        assert!(store.list_outputs_for_transaction(TRACE).await.unwrap().is_empty());

        let out = store.read_output("o1").await.unwrap().unwrap();
        assert_eq!(out.state, OutputState::Unspent);
        assert_eq!(store.list_outputs_for_asset("x", OutputState::Unspent, 0).await.unwrap().len(), 1);

        // the round can be signed again with the cleared output
        store.write_signed_round(&[linked_output("o1")], &signing()).await.unwrap();
    }

    #[tokio::test]
    async fn test_drained_transaction_never_regresses() {
        let store = SqliteStore::memory().await;
        store.write_transaction(&transaction(TransactionState::Initial)).await.unwrap();
        store.write_signed_round(&[], &signing()).await.unwrap();

        let mut observed = signing();
        observed.state = TransactionState::Initial;
        observed.receivers.clear();
        store.write_output(&linked_output("o1"), Some(&observed)).await.unwrap();
        assert_eq!(
            store.read_transaction(TRACE).await.unwrap().unwrap().state,
            TransactionState::Signing
        );

        let mut spent = linked_output("o1");
        spent.state = OutputState::Spent;
        spent.updated_at = spent.updated_at + Duration::seconds(1);
        observed.state = TransactionState::Signed;
        store.write_output(&spent, Some(&observed)).await.unwrap();

        let tx = store.read_transaction(TRACE).await.unwrap().unwrap();
        assert_eq!(tx.state, TransactionState::Signed);
        assert_eq!(tx.receivers, vec!["r".to_string()]);
    }

    #[tokio::test]
    async fn test_requeue_moves_to_tail() {
        let store = SqliteStore::memory().await;
        let first = transaction(TransactionState::Initial);
        let mut second = transaction(TransactionState::Initial);
        second.trace_id = "0f6b1a2c-3d4e-4f50-8a9b-0c1d2e3f4a5b".to_string();
        second.updated_at = first.updated_at + Duration::seconds(1);
        store.write_transaction(&first).await.unwrap();
        store.write_transaction(&second).await.unwrap();

        store
            .requeue_transaction(TRACE, first.updated_at + Duration::seconds(2))
            .await
            .unwrap();
        let queue = store.list_transactions(TransactionState::Initial, 0).await.unwrap();
        assert_eq!(queue[0].trace_id, second.trace_id);
        assert_eq!(queue[1].trace_id, TRACE);
    }
}
