//! SQLite-backed ordered key-value store

use super::keys::{self, prefix_end, Keyspace};
use super::{action, iteration, output, transaction, Store};
use crate::config::StoreConfig;
use crate::error::{GroupError, GroupResult};
use crate::model::{
    Action, CollectibleOutput, CollectibleTransaction, Iteration, Output, OutputState, Stream,
    Transaction, TransactionState,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Group state store
///
/// The whole keyspace is one `kv` table ordered bytewise by key. Writers are
/// serialised in-process so the two processing loops never race each other.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open the store and create the keyspace table
    pub async fn new(config: &StoreConfig) -> GroupResult<Self> {
        let mut options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let in_memory = config.url.contains(":memory:");
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // an in-memory database lives exactly as long as its single connection
        let max_connections = if in_memory { 1 } else { config.max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> GroupResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY NOT NULL,
                value BLOB NOT NULL
            ) WITHOUT ROWID
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Store migrations complete");
        Ok(())
    }

    #[cfg(test)]
    pub async fn memory() -> Self {
        Self::new(&StoreConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
        .expect("in-memory store")
    }
}

pub(super) async fn kv_get(conn: &mut SqliteConnection, key: &[u8]) -> GroupResult<Option<Vec<u8>>> {
    let value = sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM kv WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value)
}

pub(super) async fn kv_put(conn: &mut SqliteConnection, key: &[u8], value: &[u8]) -> GroupResult<()> {
    sqlx::query(
        r#"
        INSERT INTO kv (key, value) VALUES (?, ?)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delete an index row that must exist
pub(super) async fn kv_delete(conn: &mut SqliteConnection, key: &[u8]) -> GroupResult<()> {
    let result = sqlx::query("DELETE FROM kv WHERE key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() != 1 {
        return Err(GroupError::fatal(format!(
            "index key miscounted {}: {} rows",
            String::from_utf8_lossy(key),
            result.rows_affected()
        )));
    }
    Ok(())
}

pub(super) async fn kv_delete_prefix(conn: &mut SqliteConnection, prefix: &[u8]) -> GroupResult<u64> {
    let result = sqlx::query("DELETE FROM kv WHERE key >= ? AND key < ?")
        .bind(prefix)
        .bind(prefix_end(prefix))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Ordered prefix scan returning `(key, value)` rows
pub(super) async fn kv_scan(
    conn: &mut SqliteConnection,
    prefix: &[u8],
    limit: usize,
) -> GroupResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let limit = if limit == 0 { -1 } else { limit as i64 };
    let rows = sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>(
        "SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key LIMIT ?",
    )
    .bind(prefix)
    .bind(prefix_end(prefix))
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

pub(super) async fn kv_count(conn: &mut SqliteConnection, prefix: &[u8]) -> GroupResult<u64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM kv WHERE key >= ? AND key < ?")
        .bind(prefix)
        .bind(prefix_end(prefix))
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}

pub(super) async fn get_entity<T: DeserializeOwned>(
    conn: &mut SqliteConnection,
    key: &[u8],
) -> GroupResult<Option<T>> {
    match kv_get(conn, key).await? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub(super) async fn put_entity<T: Serialize>(
    conn: &mut SqliteConnection,
    key: &[u8],
    entity: &T,
) -> GroupResult<()> {
    let bytes = bincode::serialize(entity)?;
    kv_put(conn, key, &bytes).await
}

/// Index rows hold the id of the entity they point at
pub(super) fn index_id(key: &[u8], value: Vec<u8>) -> GroupResult<String> {
    String::from_utf8(value).map_err(|_| {
        GroupError::fatal(format!("corrupt index row {}", String::from_utf8_lossy(key)))
    })
}

/// Run one atomic write while holding the writer lock
macro_rules! write_txn {
    ($store:expr, |$conn:ident| $body:expr) => {{
        let _guard = $store.write_lock.lock().await;
        let mut txn = $store.pool.begin().await?;
        let result = {
            let $conn: &mut SqliteConnection = &mut *txn;
            $body
        };
        txn.commit().await?;
        result
    }};
}

/// Run reads on a pooled connection
macro_rules! read_conn {
    ($store:expr, |$conn:ident| $body:expr) => {{
        let mut pooled = $store.pool.acquire().await?;
        let $conn: &mut SqliteConnection = &mut *pooled;
        $body
    }};
}

#[async_trait]
impl Store for SqliteStore {
    async fn health_check(&self) -> GroupResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn read_property(&self, key: &str) -> GroupResult<Option<Vec<u8>>> {
        read_conn!(self, |conn| kv_get(conn, &keys::property(key)).await)
    }

    async fn write_property(&self, key: &str, value: &[u8]) -> GroupResult<()> {
        write_txn!(self, |conn| kv_put(conn, &keys::property(key), value).await?);
        debug!(key, "Wrote property");
        Ok(())
    }

    async fn read_output(&self, output_id: &str) -> GroupResult<Option<Output>> {
        read_conn!(self, |conn| output::read_output(conn, Keyspace::MULTISIG, output_id).await)
    }

    async fn write_output(&self, out: &Output, tx: Option<&Transaction>) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::write_drained(conn, Keyspace::MULTISIG, out, tx).await?
        });
        Ok(())
    }

    async fn reset_output(&self, out: &Output) -> GroupResult<()> {
        write_txn!(self, |conn| output::reset_output(conn, Keyspace::MULTISIG, out).await?);
        Ok(())
    }

    async fn list_outputs(&self, state: OutputState, limit: usize) -> GroupResult<Vec<Output>> {
        let ks = Keyspace::MULTISIG;
        read_conn!(self, |conn| {
            output::list_outputs(conn, ks, &ks.output_state_prefix(state), limit).await
        })
    }

    async fn list_outputs_for_asset(
        &self,
        asset_id: &str,
        state: OutputState,
        limit: usize,
    ) -> GroupResult<Vec<Output>> {
        let ks = Keyspace::MULTISIG;
        read_conn!(self, |conn| {
            output::list_outputs(conn, ks, &ks.output_asset_prefix(state, asset_id), limit).await
        })
    }

    async fn list_outputs_for_transaction(&self, trace_id: &str) -> GroupResult<Vec<Output>> {
        let ks = Keyspace::MULTISIG;
        read_conn!(self, |conn| {
            output::list_outputs(conn, ks, &ks.output_transaction_prefix(trace_id), 0).await
        })
    }

    async fn read_transaction(&self, trace_id: &str) -> GroupResult<Option<Transaction>> {
        read_conn!(self, |conn| {
            transaction::read_transaction(conn, Keyspace::MULTISIG, trace_id).await
        })
    }

    async fn write_transaction(&self, tx: &Transaction) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::write_transaction(conn, Keyspace::MULTISIG, tx).await?
        });
        Ok(())
    }

    async fn requeue_transaction(&self, trace_id: &str, at: DateTime<Utc>) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::requeue_transaction::<Transaction>(conn, Keyspace::MULTISIG, trace_id, at)
                .await?
        });
        Ok(())
    }

    async fn write_signed_round(&self, outputs: &[Output], tx: &Transaction) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::write_signed_round(conn, Keyspace::MULTISIG, outputs, tx).await?
        });
        Ok(())
    }

    async fn reset_transaction(&self, trace_id: &str) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::reset_transaction::<Output, Transaction>(
                conn,
                Keyspace::MULTISIG,
                trace_id,
            )
            .await?
        });
        Ok(())
    }

    async fn list_transactions(
        &self,
        state: TransactionState,
        limit: usize,
    ) -> GroupResult<Vec<Transaction>> {
        read_conn!(self, |conn| {
            transaction::list_transactions(conn, Keyspace::MULTISIG, state, limit).await
        })
    }

    async fn read_collectible_output(
        &self,
        output_id: &str,
    ) -> GroupResult<Option<CollectibleOutput>> {
        read_conn!(self, |conn| {
            output::read_output(conn, Keyspace::COLLECTIBLE, output_id).await
        })
    }

    async fn write_collectible_output(
        &self,
        out: &CollectibleOutput,
        tx: Option<&CollectibleTransaction>,
    ) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::write_drained(conn, Keyspace::COLLECTIBLE, out, tx).await?
        });
        Ok(())
    }

    async fn reset_collectible_output(&self, out: &CollectibleOutput) -> GroupResult<()> {
        write_txn!(self, |conn| {
            output::reset_output(conn, Keyspace::COLLECTIBLE, out).await?
        });
        Ok(())
    }

    async fn list_collectible_outputs(
        &self,
        state: OutputState,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleOutput>> {
        let ks = Keyspace::COLLECTIBLE;
        read_conn!(self, |conn| {
            output::list_outputs(conn, ks, &ks.output_state_prefix(state), limit).await
        })
    }

    async fn list_collectible_outputs_for_token(
        &self,
        token_id: &str,
        state: OutputState,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleOutput>> {
        let ks = Keyspace::COLLECTIBLE;
        read_conn!(self, |conn| {
            output::list_outputs(conn, ks, &ks.output_asset_prefix(state, token_id), limit).await
        })
    }

    async fn list_collectible_outputs_for_transaction(
        &self,
        trace_id: &str,
    ) -> GroupResult<Vec<CollectibleOutput>> {
        let ks = Keyspace::COLLECTIBLE;
        read_conn!(self, |conn| {
            output::list_outputs(conn, ks, &ks.output_transaction_prefix(trace_id), 0).await
        })
    }

    async fn read_collectible_transaction(
        &self,
        trace_id: &str,
    ) -> GroupResult<Option<CollectibleTransaction>> {
        read_conn!(self, |conn| {
            transaction::read_transaction(conn, Keyspace::COLLECTIBLE, trace_id).await
        })
    }

    async fn write_collectible_transaction(&self, tx: &CollectibleTransaction) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::write_transaction(conn, Keyspace::COLLECTIBLE, tx).await?
        });
        Ok(())
    }

    async fn requeue_collectible_transaction(
        &self,
        trace_id: &str,
        at: DateTime<Utc>,
    ) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::requeue_transaction::<CollectibleTransaction>(
                conn,
                Keyspace::COLLECTIBLE,
                trace_id,
                at,
            )
            .await?
        });
        Ok(())
    }

    async fn write_signed_collectible_round(
        &self,
        outputs: &[CollectibleOutput],
        tx: &CollectibleTransaction,
    ) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::write_signed_round(conn, Keyspace::COLLECTIBLE, outputs, tx).await?
        });
        Ok(())
    }

    async fn reset_collectible_transaction(&self, trace_id: &str) -> GroupResult<()> {
        write_txn!(self, |conn| {
            transaction::reset_transaction::<CollectibleOutput, CollectibleTransaction>(
                conn,
                Keyspace::COLLECTIBLE,
                trace_id,
            )
            .await?
        });
        Ok(())
    }

    async fn list_collectible_transactions(
        &self,
        state: TransactionState,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleTransaction>> {
        read_conn!(self, |conn| {
            transaction::list_transactions(conn, Keyspace::COLLECTIBLE, state, limit).await
        })
    }

    async fn count_transactions(&self, stream: Stream, state: TransactionState) -> GroupResult<u64> {
        let prefix = Keyspace::of(stream).transaction_state_prefix(state);
        read_conn!(self, |conn| kv_count(conn, &prefix).await)
    }

    async fn write_action(&self, stream: Stream, act: &Action) -> GroupResult<bool> {
        let written = write_txn!(self, |conn| {
            action::write_action(conn, Keyspace::of(stream), act).await?
        });
        Ok(written)
    }

    async fn list_actions(&self, stream: Stream, limit: usize) -> GroupResult<Vec<Action>> {
        read_conn!(self, |conn| {
            action::list_actions(conn, Keyspace::of(stream), limit).await
        })
    }

    async fn list_action_workers(
        &self,
        stream: Stream,
        output_id: &str,
    ) -> GroupResult<Vec<String>> {
        read_conn!(self, |conn| {
            action::list_workers(conn, Keyspace::of(stream), output_id).await
        })
    }

    async fn mark_action_worker(
        &self,
        stream: Stream,
        output_id: &str,
        worker: &str,
    ) -> GroupResult<()> {
        write_txn!(self, |conn| {
            action::mark_worker(conn, Keyspace::of(stream), output_id, worker).await?
        });
        Ok(())
    }

    async fn finish_action(&self, stream: Stream, output_id: &str) -> GroupResult<()> {
        write_txn!(self, |conn| {
            action::finish_action(conn, Keyspace::of(stream), output_id).await?
        });
        Ok(())
    }

    async fn write_iteration(&self, it: &Iteration) -> GroupResult<bool> {
        let written = write_txn!(self, |conn| iteration::write_iteration(conn, it).await?);
        Ok(written)
    }

    async fn list_iterations(&self) -> GroupResult<Vec<Iteration>> {
        read_conn!(self, |conn| iteration::list_iterations(conn).await)
    }
}
