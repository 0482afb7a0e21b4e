//! Action queue rows and per-worker completion markers

use super::keys::Keyspace;
use super::manager::{
    get_entity, index_id, kv_delete, kv_delete_prefix, kv_get, kv_put, kv_scan, put_entity,
};
use crate::error::{GroupError, GroupResult};
use crate::model::{Action, ActionState};

use sqlx::SqliteConnection;

/// Queue `act` unless its originating transaction was seen before
///
/// Outputs created by the group's own transactions never become actions, and
/// only the first output of any other transaction does.
pub(super) async fn write_action(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    act: &Action,
) -> GroupResult<bool> {
    if kv_get(conn, &ks.transaction_hash(&act.transaction_hash)).await?.is_some() {
        return Ok(false);
    }
    if kv_get(conn, &ks.action_hash(&act.transaction_hash)).await?.is_some() {
        return Ok(false);
    }
    if kv_get(conn, &ks.action_payload(&act.output_id)).await?.is_some() {
        return Ok(false);
    }

    let id = act.output_id.as_bytes();
    put_entity(conn, &ks.action_payload(&act.output_id), act).await?;
    kv_put(conn, &ks.action_state(act.state, act.created_at, &act.output_id), id).await?;
    kv_put(conn, &ks.action_hash(&act.transaction_hash), id).await?;
    Ok(true)
}

pub(super) async fn list_actions(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    limit: usize,
) -> GroupResult<Vec<Action>> {
    let rows = kv_scan(conn, &ks.action_state_prefix(ActionState::Initial), limit).await?;
    let mut actions = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        let id = index_id(&key, value)?;
        let act: Action = get_entity(conn, &ks.action_payload(&id)).await?.ok_or_else(|| {
            GroupError::fatal(format!("dangling action index {}", String::from_utf8_lossy(&key)))
        })?;
        actions.push(act);
    }
    Ok(actions)
}

pub(super) async fn list_workers(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    output_id: &str,
) -> GroupResult<Vec<String>> {
    let prefix = ks.action_worker_prefix(output_id);
    let rows = kv_scan(conn, &prefix, 0).await?;
    rows.into_iter()
        .map(|(key, _)| index_id(&key, key[prefix.len()..].to_vec()))
        .collect()
}

pub(super) async fn mark_worker(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    output_id: &str,
    worker: &str,
) -> GroupResult<()> {
    kv_put(conn, &ks.action_worker(output_id, worker), &[1]).await
}

pub(super) async fn finish_action(
    conn: &mut SqliteConnection,
    ks: Keyspace,
    output_id: &str,
) -> GroupResult<bool> {
    let old: Option<Action> = get_entity(conn, &ks.action_payload(output_id)).await?;
    let Some(old) = old else {
        return Err(GroupError::fatal(format!("finish of unknown action {}", output_id)));
    };
    if old.state == ActionState::Done {
        return Ok(false);
    }

    kv_delete(conn, &ks.action_state(old.state, old.created_at, output_id)).await?;
    let act = Action {
        state: ActionState::Done,
        ..old
    };
    put_entity(conn, &ks.action_payload(output_id), &act).await?;
    kv_put(
        conn,
        &ks.action_state(act.state, act.created_at, output_id),
        output_id.as_bytes(),
    )
    .await?;
    kv_delete_prefix(conn, &ks.action_worker_prefix(output_id)).await?;
    Ok(true)
}
