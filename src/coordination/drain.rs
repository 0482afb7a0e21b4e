//! Draining of fungible outputs and their classification

use super::checkpoint::{read_checkpoint, write_checkpoint};
use super::Group;
use crate::error::{GroupError, GroupResult};
use crate::ledger::{script_threshold, ExtraPack, RawTransaction};
use crate::model::{Action, Amount, Output, OutputState, Stream, Transaction, TransactionState};

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, error};

impl Group {
    /// Pull every fungible output updated since the checkpoint
    pub(crate) async fn drain_outputs(&self) -> GroupResult<()> {
        let batch = self.config.drain_batch_size;
        let mut filter = HashSet::new();

        loop {
            if self.is_stopped().await {
                return Ok(());
            }
            let checkpoint = read_checkpoint(&*self.store, Stream::Multisig, self.epoch).await?;
            let utxos = self
                .ledger
                .read_multisig_outputs(&self.members, self.threshold, checkpoint, batch)
                .await?;
            let count = utxos.len();
            let outputs = utxos
                .into_iter()
                .map(|utxo| {
                    let id = utxo.utxo_id.clone();
                    let state = utxo.state.clone();
                    Output::from_multisig(utxo).map_err(|e| {
                        error!(output_id = %id, state = %state, "Unrecognised output state");
                        e
                    })
                })
                .collect::<GroupResult<Vec<_>>>()?;

            let next = self.process_outputs(&mut filter, checkpoint, outputs).await?;
            let advanced = write_checkpoint(&*self.store, Stream::Multisig, next).await?;
            crate::metrics::record_checkpoint(Stream::Multisig, next);
            debug!(count, checkpoint = %next, advanced, "Drained multisig outputs");

            if count < batch / 2 || !advanced {
                return Ok(());
            }
        }
    }

    /// Persist one batch in update order, then queue actions for it
    ///
    /// Returns the checkpoint reached by the batch.
    pub(crate) async fn process_outputs(
        &self,
        filter: &mut HashSet<String>,
        mut checkpoint: DateTime<Utc>,
        outputs: Vec<Output>,
    ) -> GroupResult<DateTime<Utc>> {
        let mut accepted = Vec::with_capacity(outputs.len());
        for out in outputs {
            checkpoint = checkpoint.max(out.updated_at);
            if out.updated_at < self.epoch || !filter.insert(out.update_key()) {
                continue;
            }
            debug!(output_id = %out.output_id, signed_tx = %out.signed_tx, "Processing multisig output");
            let action = Action::new(&out.output_id, out.transaction_hash, out.created_at);
            self.classify_output(out).await?;
            accepted.push(action);
        }
        crate::metrics::record_outputs_drained(Stream::Multisig, accepted.len());

        for action in &accepted {
            self.store.write_action(Stream::Multisig, action).await?;
        }
        Ok(checkpoint)
    }

    /// Advance the local state machine with one ledger update of an output
    async fn classify_output(&self, mut out: Output) -> GroupResult<()> {
        let stored = self.store.read_output(&out.output_id).await?;
        if let Some(stored) = &stored {
            if out.updated_at <= stored.updated_at {
                debug!(output_id = %out.output_id, "Skipping stale output update");
                return Ok(());
            }
        }
        if let Some(pack) = ExtraPack::decode(out.memo.as_bytes()) {
            if !pack.group_id.is_empty() {
                out.group_id = pack.group_id;
            }
        }

        let raw = RawTransaction::decode_signed(&out.signed_tx).map_err(|e| {
            error!(output_id = %out.output_id, signed_tx = %out.signed_tx, "Undecodable signed payload");
            e
        })?;
        let Some(raw) = raw else {
            out.reset_to_unspent();
            return match stored.map(|s| s.state) {
                Some(OutputState::Signed) => self.store.reset_output(&out).await,
                _ => self.store.write_output(&out, None).await,
            };
        };

        let tx = derive_transaction(&mut out, &raw)?;
        self.store.write_output(&out, Some(&tx)).await
    }
}

/// Mirror the transaction revealed by a signed payload on `out`
///
/// Marks the output `Signed`, or `Spent` once the payload carries a quorum.
fn derive_transaction(out: &mut Output, raw: &RawTransaction) -> GroupResult<Transaction> {
    let pack = ExtraPack::decode(&raw.extra).ok_or_else(|| {
        error!(output_id = %out.output_id, signed_tx = %out.signed_tx, "Signed payload carries no trace id");
        GroupError::fatal(format!("signed payload of {} carries no trace id", out.output_id))
    })?;
    let hash = raw.payload_hash()?;
    let (amount, threshold) = raw
        .outputs
        .first()
        .map(|o| (o.amount, script_threshold(&o.script).unwrap_or_default()))
        .unwrap_or((Amount::ZERO, 0));

    let state = if raw.meets_quorum(out.threshold) {
        out.state = OutputState::Spent;
        TransactionState::Signed
    } else {
        out.state = OutputState::Signed;
        TransactionState::Initial
    };
    out.signed_by = hash.to_string();
    out.trace_id = Some(pack.trace_id.to_string());

    Ok(Transaction {
        trace_id: pack.trace_id.to_string(),
        group_id: pack.group_id,
        asset_id: out.asset_id.clone(),
        receivers: Vec::new(),
        threshold,
        amount,
        memo: pack.memo,
        state,
        raw: raw.marshal()?,
        hash: Some(hash),
        updated_at: out.updated_at,
    })
}
