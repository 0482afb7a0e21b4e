//! Output rows and their state, asset and transaction indexes

use super::keys::Keyspace;
use super::manager::{get_entity, index_id, kv_delete, kv_put, kv_scan, put_entity};
use crate::error::{GroupError, GroupResult};
use crate::model::{CollectibleOutput, Output, OutputState};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqliteConnection;

/// Common shape of fungible and collectible outputs
pub trait OutputRecord: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn id(&self) -> &str;
    fn state(&self) -> OutputState;
    /// Asset id, or token id for collectibles
    fn asset(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
    fn signed_by(&self) -> &str;
    fn trace_id(&self) -> Option<&str>;
    /// Detach from the committed transaction, abandoning a pending signature
    fn unlink(&mut self);
}

impl OutputRecord for Output {
    fn id(&self) -> &str {
        &self.output_id
    }

    fn state(&self) -> OutputState {
        self.state
    }

    fn asset(&self) -> &str {
        &self.asset_id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn signed_by(&self) -> &str {
        &self.signed_by
    }

    fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    fn unlink(&mut self) {
        if self.state == OutputState::Signed {
            self.reset_to_unspent();
        } else {
            self.trace_id = None;
        }
    }
}

impl OutputRecord for CollectibleOutput {
    fn id(&self) -> &str {
        &self.output_id
    }

    fn state(&self) -> OutputState {
        self.state
    }

    fn asset(&self) -> &str {
        &self.token_id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn signed_by(&self) -> &str {
        &self.signed_by
    }

    fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    fn unlink(&mut self) {
        if self.state == OutputState::Signed {
            self.reset_to_unspent();
        } else {
            self.trace_id = None;
        }
    }
}

pub(super) async fn read_output<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    id: &str,
) -> GroupResult<Option<O>> {
    get_entity(conn, &ks.output_payload(id)).await
}

async fn insert_indexes<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    out: &O,
) -> GroupResult<()> {
    let id = out.id().as_bytes();
    let ts = out.updated_at();
    kv_put(conn, &ks.output_state(out.state(), ts, out.id()), id).await?;
    kv_put(conn, &ks.output_asset(out.state(), out.asset(), ts, out.id()), id).await?;
    if let Some(trace_id) = out.trace_id() {
        kv_put(conn, &ks.output_transaction(trace_id, ts, out.id()), id).await?;
    }
    Ok(())
}

async fn delete_indexes<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    out: &O,
) -> GroupResult<()> {
    let ts = out.updated_at();
    kv_delete(conn, &ks.output_state(out.state(), ts, out.id())).await?;
    kv_delete(conn, &ks.output_asset(out.state(), out.asset(), ts, out.id())).await?;
    if let Some(trace_id) = out.trace_id() {
        kv_delete(conn, &ks.output_transaction(trace_id, ts, out.id())).await?;
    }
    Ok(())
}

async fn replace<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    old: Option<&O>,
    out: &O,
) -> GroupResult<()> {
    if let Some(old) = old {
        delete_indexes(conn, ks, old).await?;
    }
    put_entity(conn, &ks.output_payload(out.id()), out).await?;
    insert_indexes(conn, ks, out).await
}

/// Upsert an output following its lifecycle
///
/// Equal state is a no-op, a lower state or a different signer is fatal.
/// Returns whether anything was written.
pub(super) async fn write_output<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    out: &O,
) -> GroupResult<bool> {
    let old: Option<O> = read_output(conn, ks, out.id()).await?;
    if let Some(old) = &old {
        if old.state() == out.state() {
            return Ok(false);
        }
        if old.state() > out.state() {
            return Err(GroupError::fatal(format!(
                "output {} state regression {} -> {}",
                out.id(),
                old.state().name(),
                out.state().name()
            )));
        }
        if !old.signed_by().is_empty()
            && !out.signed_by().is_empty()
            && old.signed_by() != out.signed_by()
        {
            return Err(GroupError::fatal(format!(
                "output {} signer changed {} -> {}",
                out.id(),
                old.signed_by(),
                out.signed_by()
            )));
        }
    }
    replace(conn, ks, old.as_ref(), out).await?;
    Ok(true)
}

/// Rewrite a `Signed` output back to `Unspent`
pub(super) async fn reset_output<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    out: &O,
) -> GroupResult<bool> {
    if out.state() != OutputState::Unspent || out.trace_id().is_some() {
        return Err(GroupError::fatal(format!(
            "output {} reset to {} with link {:?}",
            out.id(),
            out.state().name(),
            out.trace_id()
        )));
    }
    let old: Option<O> = read_output(conn, ks, out.id()).await?;
    match old.as_ref().map(|o| o.state()) {
        Some(OutputState::Unspent) => Ok(false),
        None | Some(OutputState::Signed) => {
            replace(conn, ks, old.as_ref(), out).await?;
            Ok(true)
        }
        Some(state) => Err(GroupError::fatal(format!(
            "output {} state regression {} -> unspent",
            out.id(),
            state.name()
        ))),
    }
}

/// Detach every output committed to `trace_id`, returning how many were touched
pub(super) async fn unlink_outputs<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    trace_id: &str,
) -> GroupResult<usize> {
    let linked: Vec<O> = list_outputs(conn, ks, &ks.output_transaction_prefix(trace_id), 0).await?;
    for old in &linked {
        let mut out = old.clone();
        out.unlink();
        replace(conn, ks, Some(old), &out).await?;
    }
    Ok(linked.len())
}

pub(super) async fn list_outputs<O: OutputRecord>(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    prefix: &[u8],
    limit: usize,
) -> GroupResult<Vec<O>> {
    let rows = kv_scan(conn, prefix, limit).await?;
    let mut outputs = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        let id = index_id(&key, value)?;
        let out = read_output(conn, ks, &id).await?.ok_or_else(|| {
            GroupError::fatal(format!("dangling output index {}", String::from_utf8_lossy(&key)))
        })?;
        outputs.push(out);
    }
    Ok(outputs)
}
