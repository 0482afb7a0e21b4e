//! Draining of collectible outputs
//!
//! Mirrors the fungible pipeline. Trace ids come from the content hash of the
//! payload carried in the transaction extra.

use super::checkpoint::{read_checkpoint, write_checkpoint};
use super::Group;
use crate::error::GroupResult;
use crate::ledger::{script_threshold, RawTransaction};
use crate::model::collectible::nfo_trace_id;
use crate::model::{
    Action, Amount, CollectibleOutput, CollectibleTransaction, OutputState, Stream,
    TransactionState,
};

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, error};

impl Group {
    pub(crate) async fn drain_collectible_outputs(&self) -> GroupResult<()> {
        let batch = self.config.drain_batch_size;
        let mut filter = HashSet::new();

        loop {
            if self.is_stopped().await {
                return Ok(());
            }
            let checkpoint =
                read_checkpoint(&*self.store, Stream::Collectible, self.epoch).await?;
            let utxos = self
                .ledger
                .read_collectible_outputs(&self.members, self.threshold, checkpoint, batch)
                .await?;
            let count = utxos.len();
            let outputs = utxos
                .into_iter()
                .map(|utxo| {
                    let id = utxo.output_id.clone();
                    let state = utxo.state.clone();
                    CollectibleOutput::from_collectible(utxo).map_err(|e| {
                        error!(output_id = %id, state = %state, "Unrecognised collectible state");
                        e
                    })
                })
                .collect::<GroupResult<Vec<_>>>()?;

            let next = self
                .process_collectible_outputs(&mut filter, checkpoint, outputs)
                .await?;
            let advanced = write_checkpoint(&*self.store, Stream::Collectible, next).await?;
            crate::metrics::record_checkpoint(Stream::Collectible, next);
            debug!(count, checkpoint = %next, advanced, "Drained collectible outputs");

            if count < batch / 2 || !advanced {
                return Ok(());
            }
        }
    }

    pub(crate) async fn process_collectible_outputs(
        &self,
        filter: &mut HashSet<String>,
        mut checkpoint: DateTime<Utc>,
        outputs: Vec<CollectibleOutput>,
    ) -> GroupResult<DateTime<Utc>> {
        let mut accepted = Vec::with_capacity(outputs.len());
        for out in outputs {
            checkpoint = checkpoint.max(out.updated_at);
            if out.updated_at < self.epoch || !filter.insert(out.update_key()) {
                continue;
            }
            let action = Action::new(&out.output_id, out.transaction_hash, out.created_at);
            self.classify_collectible_output(out).await?;
            accepted.push(action);
        }
        crate::metrics::record_outputs_drained(Stream::Collectible, accepted.len());

        for action in &accepted {
            self.store.write_action(Stream::Collectible, action).await?;
        }
        Ok(checkpoint)
    }

    async fn classify_collectible_output(&self, mut out: CollectibleOutput) -> GroupResult<()> {
        let stored = self.store.read_collectible_output(&out.output_id).await?;
        if let Some(stored) = &stored {
            if out.updated_at <= stored.updated_at {
                return Ok(());
            }
        }

        let raw = RawTransaction::decode_signed(&out.signed_tx).map_err(|e| {
            error!(output_id = %out.output_id, signed_tx = %out.signed_tx, "Undecodable collectible payload");
            e
        })?;
        let Some(raw) = raw else {
            out.reset_to_unspent();
            return match stored.map(|s| s.state) {
                Some(OutputState::Signed) => self.store.reset_collectible_output(&out).await,
                _ => self.store.write_collectible_output(&out, None).await,
            };
        };

        let trace_id = nfo_trace_id(&raw.extra);
        let hash = raw.payload_hash()?;
        let (amount, threshold) = raw
            .outputs
            .first()
            .map(|o| (o.amount, script_threshold(&o.script).unwrap_or_default()))
            .unwrap_or((Amount::ZERO, 0));

        let state = if raw.meets_quorum(out.receivers_threshold) {
            out.state = OutputState::Spent;
            TransactionState::Signed
        } else {
            out.state = OutputState::Signed;
            TransactionState::Initial
        };
        out.signed_by = hash.to_string();
        out.trace_id = Some(trace_id.clone());

        let tx = CollectibleTransaction {
            trace_id,
            state,
            receivers: Vec::new(),
            threshold,
            amount,
            nfo: raw.extra.clone(),
            raw: raw.marshal()?,
            hash: Some(hash),
            updated_at: out.updated_at,
        };
        self.store.write_collectible_output(&out, Some(&tx)).await
    }
}
