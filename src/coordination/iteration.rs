//! Membership roster
//!
//! Roster changes are recorded as iterations and take effect the next time the
//! group is built.

use super::Group;
use crate::config::GenesisConfig;
use crate::error::{GroupError, GroupResult};
use crate::model::{Hash, Iteration, IterationAction};
use crate::state::Store;

use chrono::{DateTime, Utc};
use tracing::info;

/// Active roster: sorted members, signer threshold and epoch
pub type ActiveNodes = (Vec<String>, u8, DateTime<Utc>);

pub async fn record_iteration(
    store: &dyn Store,
    action: IterationAction,
    node_id: &str,
    threshold: u8,
    created_at: DateTime<Utc>,
) -> GroupResult<bool> {
    if node_id.is_empty() {
        return Err(GroupError::Config("empty node id".to_string()));
    }
    if threshold < 1 {
        return Err(GroupError::Config(format!("invalid threshold {} for {}", threshold, node_id)));
    }
    let written = store
        .write_iteration(&Iteration {
            action,
            node_id: node_id.to_string(),
            threshold,
            created_at,
        })
        .await?;
    if written {
        info!(node_id, threshold, ?action, %created_at, "Recorded roster iteration");
    }
    Ok(written)
}

/// Derive the active roster from the latest event of every node
pub async fn active_nodes(store: &dyn Store) -> GroupResult<ActiveNodes> {
    let iterations = store.list_iterations().await?;
    let Some(latest) = iterations.last() else {
        return Err(GroupError::Config("empty membership roster".to_string()));
    };
    let threshold = latest.threshold;
    let epoch = latest.created_at;

    let mut members: Vec<String> = iterations
        .iter()
        .filter(|it| it.action == IterationAction::Add)
        .map(|it| it.node_id.clone())
        .collect();
    members.sort();

    if members.is_empty() || usize::from(threshold) > members.len() {
        return Err(GroupError::Config(format!(
            "invalid roster threshold {}/{}",
            threshold,
            members.len()
        )));
    }
    Ok((members, threshold, epoch))
}

/// Stable identifier of a genesis configuration
pub fn generate_genesis_id(genesis: &GenesisConfig) -> String {
    let mut members = genesis.members.clone();
    members.sort();
    let id = format!("{}:{}:{}", members.join(""), genesis.threshold, genesis.timestamp);
    Hash::digest(id.as_bytes()).to_string()
}

impl Group {
    pub async fn add_node(
        &self,
        node_id: &str,
        threshold: u8,
        at: DateTime<Utc>,
    ) -> GroupResult<bool> {
        record_iteration(&*self.store, IterationAction::Add, node_id, threshold, at).await
    }

    pub async fn remove_node(
        &self,
        node_id: &str,
        threshold: u8,
        at: DateTime<Utc>,
    ) -> GroupResult<bool> {
        record_iteration(&*self.store, IterationAction::Remove, node_id, threshold, at).await
    }

    pub async fn list_active_nodes(&self) -> GroupResult<ActiveNodes> {
        active_nodes(&*self.store).await
    }
}
