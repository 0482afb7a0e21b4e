//! Membership roster rows

use super::keys;
use super::manager::{get_entity, index_id, kv_delete, kv_put, kv_scan, put_entity};
use crate::error::{GroupError, GroupResult};
use crate::model::Iteration;

use sqlx::SqliteConnection;

pub(super) async fn write_iteration(
    conn: &mut SqliteConnection,
    it: &Iteration,
) -> GroupResult<bool> {
    let key = keys::iteration_payload(&it.node_id);
    let old: Option<Iteration> = get_entity(conn, &key).await?;
    if let Some(old) = &old {
        if old.created_at >= it.created_at {
            return Ok(false);
        }
        kv_delete(conn, &keys::iteration_queue(old.created_at, &old.node_id)).await?;
    }

    put_entity(conn, &key, it).await?;
    kv_put(
        conn,
        &keys::iteration_queue(it.created_at, &it.node_id),
        it.node_id.as_bytes(),
    )
    .await?;
    Ok(true)
}

/// Latest event of every node, oldest first
pub(super) async fn list_iterations(conn: &mut SqliteConnection) -> GroupResult<Vec<Iteration>> {
    let rows = kv_scan(conn, &keys::iteration_queue_prefix(), 0).await?;
    let mut iterations = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        let node_id = index_id(&key, value)?;
        let it = get_entity(conn, &keys::iteration_payload(&node_id))
            .await?
            .ok_or_else(|| GroupError::fatal(format!("dangling iteration {}", node_id)))?;
        iterations.push(it);
    }
    Ok(iterations)
}
