//! Threshold signing cycle
//!
//! Exactly one transaction per stream is signed per pass, so concurrent rounds
//! never contend for the same inputs.

use crate::coordination::Group;
use crate::error::{GroupError, GroupResult};
use crate::ledger::{ExtraPack, RawTransaction};
use crate::model::collectible::{nfo_trace_id, COLLECTIBLE_META_TOKEN_ID};
use crate::model::{
    CollectibleTransaction, OutputState, Stream, Transaction, TransactionState,
};

use tracing::{debug, error, info, warn};

/// Outcome of one attempt to sign the head of the queue
enum SignOutcome {
    Signed,
    /// The transaction cannot be funded right now
    Requeue(String),
}

impl Group {
    pub(crate) async fn sign_transactions(&self) -> GroupResult<()> {
        self.recover_signing_transactions().await?;

        let Some(tx) = self.next_signable_transaction().await? else {
            return Ok(());
        };
        if self.is_stopped().await {
            return Ok(());
        }

        match self.sign_transaction(&tx).await? {
            SignOutcome::Signed => crate::metrics::record_transaction_signed(Stream::Multisig),
            SignOutcome::Requeue(reason) => {
                warn!(trace_id = %tx.trace_id, "Requeueing transaction: {}", reason);
                let at = self.clock.now().await;
                self.store.requeue_transaction(&tx.trace_id, at).await?;
                crate::metrics::record_transaction_requeued(Stream::Multisig);
            }
        }
        Ok(())
    }

    /// Rebuild transactions whose signing round was abandoned
    async fn recover_signing_transactions(&self) -> GroupResult<()> {
        for tx in self.store.list_transactions(TransactionState::Signing, 0).await? {
            let linked = self.store.list_outputs_for_transaction(&tx.trace_id).await?;
            if linked.iter().all(|o| o.signed_tx.is_empty()) {
                warn!(trace_id = %tx.trace_id, "Signing round abandoned, rebuilding");
                self.store.reset_transaction(&tx.trace_id).await?;
            }
        }
        Ok(())
    }

    /// Oldest `Initial` transaction this node can sign now
    ///
    /// A co-signed transaction has no receivers to rebuild it from, so it stays
    /// parked until the ledger reports a payload on one of its outputs again.
    async fn next_signable_transaction(&self) -> GroupResult<Option<Transaction>> {
        for tx in self.store.list_transactions(TransactionState::Initial, 0).await? {
            if !tx.receivers.is_empty() {
                return Ok(Some(tx));
            }
            let linked = self.store.list_outputs_for_transaction(&tx.trace_id).await?;
            if linked.iter().any(|o| !o.signed_tx.is_empty()) {
                return Ok(Some(tx));
            }
            debug!(trace_id = %tx.trace_id, "Transaction parked until its round resumes");
        }
        Ok(None)
    }

    async fn sign_transaction(&self, tx: &Transaction) -> GroupResult<SignOutcome> {
        let mut inputs = self.store.list_outputs_for_transaction(&tx.trace_id).await?;
        if inputs.is_empty() {
            inputs = self
                .store
                .list_outputs_for_asset(&tx.asset_id, OutputState::Unspent, self.config.max_inputs)
                .await?;
        }
        if inputs.is_empty() {
            return Ok(SignOutcome::Requeue(format!("no unspent outputs for {}", tx.asset_id)));
        }

        let payload = inputs
            .iter()
            .find(|o| !o.signed_tx.is_empty())
            .map(|o| o.signed_tx.as_str())
            .unwrap_or_default();
        let raw = match RawTransaction::decode_signed(payload)? {
            Some(raw) => raw,
            None if tx.receivers.is_empty() => {
                return Ok(SignOutcome::Requeue("no receivers to rebuild for".to_string()));
            }
            None => match self.build_raw_transaction(tx, &inputs).await {
                Ok(raw) => raw,
                Err(e @ GroupError::InsufficientFunds { .. }) => {
                    return Ok(SignOutcome::Requeue(e.to_string()))
                }
                Err(e) => return Err(e),
            },
        };

        let signed_tx = self.collect_signature(Stream::Multisig, &raw).await?;
        let signed = RawTransaction::decode_signed(&signed_tx)?
            .ok_or_else(|| GroupError::fatal(format!("empty signed payload for {}", tx.trace_id)))?;
        let trace = ExtraPack::decode(&signed.extra).map(|p| p.trace_id.to_string());
        if trace.as_deref() != Some(tx.trace_id.as_str()) {
            error!(trace_id = %tx.trace_id, raw = %signed_tx, "Signed payload carries a foreign trace id");
            return Err(GroupError::fatal(format!(
                "signed payload of {} carries trace {:?}",
                tx.trace_id, trace
            )));
        }

        let hash = signed.payload_hash()?;
        for out in &mut inputs {
            if out.state == OutputState::Unspent {
                out.state = OutputState::Signed;
                out.signed_by = hash.to_string();
                out.signed_tx = signed_tx.clone();
            }
            out.trace_id = Some(tx.trace_id.clone());
        }
        let next = Transaction {
            state: TransactionState::Signing,
            raw: signed.marshal()?,
            hash: Some(hash),
            updated_at: self.clock.now().await,
            ..tx.clone()
        };
        self.store.write_signed_round(&inputs, &next).await?;
        info!(trace_id = %tx.trace_id, hash = %hash, inputs = inputs.len(), "Transaction signing");
        Ok(SignOutcome::Signed)
    }

    pub(crate) async fn sign_collectible_transactions(&self) -> GroupResult<()> {
        self.recover_signing_collectible_transactions().await?;

        let Some(tx) = self.next_signable_collectible_transaction().await? else {
            return Ok(());
        };
        if self.is_stopped().await {
            return Ok(());
        }

        match self.sign_collectible_transaction(&tx).await? {
            SignOutcome::Signed => crate::metrics::record_transaction_signed(Stream::Collectible),
            SignOutcome::Requeue(reason) => {
                warn!(trace_id = %tx.trace_id, "Requeueing collectible transaction: {}", reason);
                let at = self.clock.now().await;
                self.store.requeue_collectible_transaction(&tx.trace_id, at).await?;
                crate::metrics::record_transaction_requeued(Stream::Collectible);
            }
        }
        Ok(())
    }

    async fn recover_signing_collectible_transactions(&self) -> GroupResult<()> {
        let txs = self
            .store
            .list_collectible_transactions(TransactionState::Signing, 0)
            .await?;
        for tx in txs {
            let linked = self
                .store
                .list_collectible_outputs_for_transaction(&tx.trace_id)
                .await?;
            if linked.iter().all(|o| o.signed_tx.is_empty()) {
                warn!(trace_id = %tx.trace_id, "Collectible signing round abandoned, rebuilding");
                self.store.reset_collectible_transaction(&tx.trace_id).await?;
            }
        }
        Ok(())
    }

    async fn next_signable_collectible_transaction(
        &self,
    ) -> GroupResult<Option<CollectibleTransaction>> {
        let txs = self
            .store
            .list_collectible_transactions(TransactionState::Initial, 0)
            .await?;
        for tx in txs {
            if !tx.receivers.is_empty() {
                return Ok(Some(tx));
            }
            let linked = self
                .store
                .list_collectible_outputs_for_transaction(&tx.trace_id)
                .await?;
            if linked.iter().any(|o| !o.signed_tx.is_empty()) {
                return Ok(Some(tx));
            }
            debug!(trace_id = %tx.trace_id, "Collectible transaction parked until its round resumes");
        }
        Ok(None)
    }

    async fn sign_collectible_transaction(
        &self,
        tx: &CollectibleTransaction,
    ) -> GroupResult<SignOutcome> {
        let mut inputs = self
            .store
            .list_collectible_outputs_for_transaction(&tx.trace_id)
            .await?;
        if inputs.is_empty() {
            inputs = self
                .store
                .list_collectible_outputs_for_token(COLLECTIBLE_META_TOKEN_ID, OutputState::Unspent, 1)
                .await?;
        }
        if inputs.is_empty() {
            return Ok(SignOutcome::Requeue(
                GroupError::NoCollectibleCarrier {
                    trace_id: tx.trace_id.clone(),
                }
                .to_string(),
            ));
        }

        let payload = inputs
            .iter()
            .find(|o| !o.signed_tx.is_empty())
            .map(|o| o.signed_tx.as_str())
            .unwrap_or_default();
        let raw = match RawTransaction::decode_signed(payload)? {
            Some(raw) => raw,
            None if tx.receivers.is_empty() => {
                return Ok(SignOutcome::Requeue("no receivers to rebuild for".to_string()));
            }
            None => match self.build_raw_collectible_mint_transaction(tx, &inputs).await {
                Ok(raw) => raw,
                Err(e @ GroupError::InsufficientFunds { .. }) => {
                    return Ok(SignOutcome::Requeue(e.to_string()))
                }
                Err(e) => return Err(e),
            },
        };

        let signed_tx = self.collect_signature(Stream::Collectible, &raw).await?;
        let signed = RawTransaction::decode_signed(&signed_tx)?
            .ok_or_else(|| GroupError::fatal(format!("empty signed payload for {}", tx.trace_id)))?;
        if nfo_trace_id(&signed.extra) != tx.trace_id {
            error!(trace_id = %tx.trace_id, raw = %signed_tx, "Signed collectible payload does not match");
            return Err(GroupError::fatal(format!(
                "signed collectible payload does not match {}",
                tx.trace_id
            )));
        }

        let hash = signed.payload_hash()?;
        for out in &mut inputs {
            if out.state == OutputState::Unspent {
                out.state = OutputState::Signed;
                out.signed_by = hash.to_string();
                out.signed_tx = signed_tx.clone();
            }
            out.trace_id = Some(tx.trace_id.clone());
        }
        let next = CollectibleTransaction {
            state: TransactionState::Signing,
            raw: signed.marshal()?,
            hash: Some(hash),
            updated_at: self.clock.now().await,
            ..tx.clone()
        };
        self.store.write_signed_collectible_round(&inputs, &next).await?;
        info!(trace_id = %tx.trace_id, hash = %hash, "Collectible transaction signing");
        Ok(SignOutcome::Signed)
    }

    /// Add this node's partial signature, unless the payload already has a quorum
    async fn collect_signature(&self, stream: Stream, raw: &RawTransaction) -> GroupResult<String> {
        let hex = raw.to_hex()?;
        if raw.meets_quorum(self.threshold) {
            debug!(stream = stream.label(), "Payload already carries a quorum");
            return Ok(hex);
        }
        let request = self.ledger.create_sign_request(stream, &hex).await?;
        let signed = self
            .ledger
            .sign_request(stream, &request.request_id, &self.pin)
            .await?;
        Ok(signed.raw_transaction)
    }
}
