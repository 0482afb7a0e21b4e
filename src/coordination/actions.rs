//! Action queue dispatch

use super::{Group, Worker};
use crate::error::{GroupError, GroupResult};
use crate::model::{Action, Stream};

use std::sync::Arc;
use tracing::{debug, error};

impl Group {
    /// Offer pending fungible outputs to every worker, in creation order
    pub(crate) async fn process_actions(&self) -> GroupResult<()> {
        let actions = self
            .store
            .list_actions(Stream::Multisig, self.config.action_batch_size)
            .await?;
        for act in actions {
            if self.is_stopped().await {
                break;
            }
            let out = self.store.read_output(&act.output_id).await?.ok_or_else(|| {
                GroupError::fatal(format!("action for unknown output {}", act.output_id))
            })?;
            for worker in self.pending_workers(Stream::Multisig, &act).await? {
                let result = worker.process_output(self, &out).await;
                self.complete_worker(Stream::Multisig, &act, worker.as_ref(), result).await?;
            }
            self.store.finish_action(Stream::Multisig, &act.output_id).await?;
            crate::metrics::record_action_dispatched(Stream::Multisig);
        }
        Ok(())
    }

    pub(crate) async fn process_collectible_actions(&self) -> GroupResult<()> {
        let actions = self
            .store
            .list_actions(Stream::Collectible, self.config.action_batch_size)
            .await?;
        for act in actions {
            if self.is_stopped().await {
                break;
            }
            let out = self
                .store
                .read_collectible_output(&act.output_id)
                .await?
                .ok_or_else(|| {
                    GroupError::fatal(format!("action for unknown collectible {}", act.output_id))
                })?;
            for worker in self.pending_workers(Stream::Collectible, &act).await? {
                let result = worker.process_collectible_output(self, &out).await;
                self.complete_worker(Stream::Collectible, &act, worker.as_ref(), result).await?;
            }
            self.store.finish_action(Stream::Collectible, &act.output_id).await?;
            crate::metrics::record_action_dispatched(Stream::Collectible);
        }
        Ok(())
    }

    /// Workers that have not yet completed `act`, in dispatch order
    async fn pending_workers(&self, stream: Stream, act: &Action) -> GroupResult<Vec<Arc<dyn Worker>>> {
        let done = self.store.list_action_workers(stream, &act.output_id).await?;
        Ok(self
            .workers
            .iter()
            .filter(|w| !done.iter().any(|name| name == w.name()))
            .cloned()
            .collect())
    }

    /// Record a worker run; only a retryable failure leaves the loop recoverable
    async fn complete_worker(
        &self,
        stream: Stream,
        act: &Action,
        worker: &dyn Worker,
        result: GroupResult<()>,
    ) -> GroupResult<()> {
        match result {
            Ok(()) => {
                debug!(stream = stream.label(), output_id = %act.output_id, worker = worker.name(), "Worker completed");
                self.store
                    .mark_action_worker(stream, &act.output_id, worker.name())
                    .await
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                error!(stream = stream.label(), output_id = %act.output_id, worker = worker.name(), "Worker failed: {}", e);
                Err(GroupError::fatal(format!(
                    "worker {} failed on {} output {}: {}",
                    worker.name(),
                    stream.label(),
                    act.output_id,
                    e
                )))
            }
        }
    }
}
