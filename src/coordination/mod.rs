//! Group coordination engine
//!
//! The coordinator runs two identical pipelines, one per output stream:
//! 1. Drains outputs updated since the persisted checkpoint
//! 2. Offers newly arrived outputs to every registered worker
//! 3. Threshold-signs one outstanding transaction
//! 4. Publishes signed transactions and confirms their snapshots

mod actions;
pub mod checkpoint;
pub mod clock;
mod collectible;
mod drain;
pub mod engine;
pub mod iteration;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use clock::MonotonicClock;
pub use engine::Group;
pub use iteration::generate_genesis_id;

use crate::error::GroupResult;
use crate::model::{CollectibleOutput, Output};

use async_trait::async_trait;

/// Application logic reacting to newly arrived group outputs
///
/// Each worker sees every output exactly once, in ledger creation order, and
/// may request outgoing transfers through [`Group::build_transaction`]. The
/// name identifies the worker's completion markers and must stay stable
/// across restarts.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn process_output(&self, group: &Group, output: &Output) -> GroupResult<()>;

    async fn process_collectible_output(
        &self,
        _group: &Group,
        _output: &CollectibleOutput,
    ) -> GroupResult<()> {
        Ok(())
    }
}
