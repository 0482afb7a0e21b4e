//! Transaction requests and raw transaction assembly

use crate::coordination::Group;
use crate::error::{GroupError, GroupResult};
use crate::ledger::{ExtraPack, GhostInput, GhostKeys, RawTransaction, EXTRA_SIZE_LIMIT};
use crate::model::collectible::{nfo_trace_id, COLLECTIBLE_ASSET_ID, COLLECTIBLE_META_TOKEN_ID};
use crate::model::{
    Amount, CollectibleOutput, CollectibleTransaction, Hash, Output, OutputState, Stream,
    Transaction, TransactionState,
};

use tracing::info;
use uuid::Uuid;

/// Largest memo or collectible payload accepted with a request
pub const MAX_MEMO_SIZE: usize = EXTRA_SIZE_LIMIT;

/// Receiver side of a transaction being assembled
struct Transfer<'a> {
    trace_id: &'a str,
    asset_id: &'a str,
    receivers: &'a [String],
    threshold: u8,
    amount: Amount,
}

fn validate_receivers(receivers: &[String]) -> GroupResult<()> {
    for r in receivers {
        match Uuid::parse_str(r) {
            Ok(id) if !id.is_nil() => {}
            _ => return Err(GroupError::InvalidReceiver(r.clone())),
        }
    }
    Ok(())
}

fn total_amount<'a>(mut amounts: impl Iterator<Item = &'a Amount>) -> GroupResult<Amount> {
    amounts.try_fold(Amount::ZERO, |acc, a| {
        acc.checked_add(*a)
            .ok_or_else(|| GroupError::fatal("output amounts overflow"))
    })
}

impl Group {
    /// Request a transfer out of the group
    ///
    /// Idempotent per `trace_id`: once a transaction exists for it, later calls
    /// succeed without touching state, whatever their parameters.
    pub async fn build_transaction(
        &self,
        asset_id: &str,
        receivers: &[String],
        threshold: u8,
        amount: &str,
        memo: &str,
        trace_id: &str,
    ) -> GroupResult<()> {
        if threshold < 1 || usize::from(threshold) > receivers.len() {
            return Err(GroupError::InvalidThreshold {
                threshold: i64::from(threshold),
                receivers: receivers.len(),
            });
        }
        let amount: Amount = amount.parse()?;
        if amount < Amount::MIN {
            return Err(GroupError::InvalidAmount(amount.to_string()));
        }
        if memo.len() > MAX_MEMO_SIZE {
            return Err(GroupError::MemoTooLarge {
                size: memo.len(),
                limit: MAX_MEMO_SIZE,
            });
        }
        ExtraPack::encode_bounded(trace_id, "", memo)?;
        validate_receivers(receivers)?;

        if self.store.read_transaction(trace_id).await?.is_some() {
            return Ok(());
        }

        let unspent = self
            .store
            .list_outputs_for_asset(asset_id, OutputState::Unspent, self.config.max_inputs)
            .await?;
        let have = total_amount(unspent.iter().map(|o| &o.amount))?;
        if have < amount {
            return Err(GroupError::InsufficientFunds {
                asset_id: asset_id.to_string(),
                have: have.to_string(),
                need: amount.to_string(),
            });
        }

        let tx = Transaction {
            trace_id: trace_id.to_string(),
            group_id: String::new(),
            asset_id: asset_id.to_string(),
            receivers: receivers.to_vec(),
            threshold,
            amount,
            memo: memo.to_string(),
            state: TransactionState::Initial,
            raw: Vec::new(),
            hash: None,
            updated_at: self.clock.now().await,
        };
        self.store.write_transaction(&tx).await?;
        crate::metrics::record_transaction_built(Stream::Multisig);
        info!(trace_id, asset_id, amount = %amount, "Transaction requested");
        Ok(())
    }

    /// Request a mint of the collectible described by `nfo` to `receiver`
    ///
    /// The trace id is derived from the payload, so a repeated mint of the
    /// same content is a no-op. Fails without an unspent carrier output.
    pub async fn build_collectible_mint_transaction(
        &self,
        receiver: &str,
        nfo: &[u8],
    ) -> GroupResult<()> {
        validate_receivers(&[receiver.to_string()])?;
        if nfo.len() > MAX_MEMO_SIZE {
            return Err(GroupError::MemoTooLarge {
                size: nfo.len(),
                limit: MAX_MEMO_SIZE,
            });
        }

        let trace_id = nfo_trace_id(nfo);
        if self.store.read_collectible_transaction(&trace_id).await?.is_some() {
            return Ok(());
        }

        let carriers = self
            .store
            .list_collectible_outputs_for_token(COLLECTIBLE_META_TOKEN_ID, OutputState::Unspent, 1)
            .await?;
        if carriers.is_empty() {
            return Err(GroupError::NoCollectibleCarrier { trace_id });
        }

        let tx = CollectibleTransaction {
            trace_id: trace_id.clone(),
            state: TransactionState::Initial,
            receivers: vec![receiver.to_string()],
            threshold: 1,
            amount: Amount::MIN,
            nfo: nfo.to_vec(),
            raw: Vec::new(),
            hash: None,
            updated_at: self.clock.now().await,
        };
        self.store.write_collectible_transaction(&tx).await?;
        crate::metrics::record_transaction_built(Stream::Collectible);
        info!(trace_id = %trace_id, receiver, "Collectible mint requested");
        Ok(())
    }

    /// One-time keys for the receiver output and the change output
    async fn ghost_keys(&self, trace_id: &str, receivers: &[String]) -> GroupResult<(GhostKeys, GhostKeys)> {
        let keys = self
            .ledger
            .read_ghost_keys(vec![
                GhostInput {
                    receivers: receivers.to_vec(),
                    index: 0,
                    hint: trace_id.to_string(),
                },
                GhostInput {
                    receivers: self.members.clone(),
                    index: 1,
                    hint: trace_id.to_string(),
                },
            ])
            .await?;
        let mut keys = keys.into_iter();
        match (keys.next(), keys.next()) {
            (Some(receiver), Some(change)) => Ok((receiver, change)),
            _ => Err(GroupError::ledger("/outputs", "missing ghost keys")),
        }
    }

    /// Spend `inputs` into a receiver output plus change back to the group
    async fn assemble(
        &self,
        mut raw: RawTransaction,
        transfer: Transfer<'_>,
        inputs: impl Iterator<Item = (Hash, u32, Amount)>,
    ) -> GroupResult<RawTransaction> {
        let mut total = Amount::ZERO;
        for (hash, index, value) in inputs {
            total = total
                .checked_add(value)
                .ok_or_else(|| GroupError::fatal("output amounts overflow"))?;
            raw.add_input(hash, index);
        }
        let Some(change) = total.checked_sub(transfer.amount) else {
            return Err(GroupError::InsufficientFunds {
                asset_id: transfer.asset_id.to_string(),
                have: total.to_string(),
                need: transfer.amount.to_string(),
            });
        };

        let (receiver_keys, change_keys) =
            self.ghost_keys(transfer.trace_id, transfer.receivers).await?;
        raw.outputs
            .push(receiver_keys.dump_output(transfer.threshold, transfer.amount));
        if !change.is_zero() {
            raw.outputs.push(change_keys.dump_output(self.threshold, change));
        }
        Ok(raw)
    }

    pub(crate) async fn build_raw_transaction(
        &self,
        tx: &Transaction,
        inputs: &[Output],
    ) -> GroupResult<RawTransaction> {
        let mut raw = RawTransaction::new(Hash::digest(tx.asset_id.as_bytes()));
        raw.extra = ExtraPack::encode_bounded(&tx.trace_id, &tx.group_id, &tx.memo)?.into_bytes();
        self.assemble(
            raw,
            Transfer {
                trace_id: &tx.trace_id,
                asset_id: &tx.asset_id,
                receivers: &tx.receivers,
                threshold: tx.threshold,
                amount: tx.amount,
            },
            inputs.iter().map(|o| (o.transaction_hash, o.output_index, o.amount)),
        )
        .await
    }

    pub(crate) async fn build_raw_collectible_mint_transaction(
        &self,
        tx: &CollectibleTransaction,
        inputs: &[CollectibleOutput],
    ) -> GroupResult<RawTransaction> {
        if tx.amount != Amount::MIN {
            return Err(GroupError::fatal(format!(
                "collectible {} amount {}",
                tx.trace_id, tx.amount
            )));
        }
        let asset: Hash = COLLECTIBLE_ASSET_ID
            .parse()
            .map_err(|e| GroupError::fatal(format!("collectible asset id: {}", e)))?;
        let mut raw = RawTransaction::new(asset);
        raw.extra = tx.nfo.clone();
        self.assemble(
            raw,
            Transfer {
                trace_id: &tx.trace_id,
                asset_id: COLLECTIBLE_ASSET_ID,
                receivers: &tx.receivers,
                threshold: tx.threshold,
                amount: tx.amount,
            },
            inputs.iter().map(|o| (o.transaction_hash, o.output_index, o.amount)),
        )
        .await
    }
}
