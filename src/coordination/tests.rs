//! End-to-end coordinator scenarios against the in-memory ledger

use super::testing::*;
use super::Worker;
use crate::error::{GroupError, GroupResult};
use crate::ledger::codec::threshold_script;
use crate::ledger::{ExtraPack, MockLedgerApi, MultisigUtxo, RawOutput, RawTransaction};
use crate::model::collectible::{nfo_trace_id, COLLECTIBLE_META_TOKEN_ID};
use crate::model::{Amount, Hash, Output, OutputState, Stream, Transaction, TransactionState};
use crate::state::{SqliteStore, Store};

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const TRACE: &str = "5f1b2a3c-4d5e-4f60-8a7b-9c0d1e2f3a4b";
const FOREIGN_TRACE: &str = "0c1d2e3f-4a5b-4c6d-8e7f-9a0b1c2d3e4f";

fn receivers() -> Vec<String> {
    vec![RECEIVER.to_string()]
}

fn units(s: &str) -> Amount {
    s.parse().unwrap()
}

/// Partially signed payload another member produced for `trace`
fn foreign_payload(trace: &str) -> String {
    let mut raw = RawTransaction::new(Hash::digest(ASSET.as_bytes()));
    raw.add_input(Hash::digest(b"deposit-2"), 0);
    raw.outputs.push(RawOutput {
        amount: units("1"),
        keys: vec!["k".to_string()],
        mask: "m".to_string(),
        script: threshold_script(1),
    });
    raw.extra = ExtraPack::encode_bounded(trace, "", "").unwrap().into_bytes();
    raw.to_hex().unwrap()
}

async fn signed_scenario() -> (super::Group, Arc<FakeLedger>) {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_multisig(multisig_utxo("o1", b"deposit", 1_000_000_000, 10));
    group.drain_outputs().await.unwrap();
    group
        .build_transaction(ASSET, &receivers(), 1, "6", "memo", TRACE)
        .await
        .unwrap();
    group.sign_transactions().await.unwrap();
    (group, ledger)
}

#[tokio::test]
async fn test_build_then_sign_spends_with_change() {
    let (group, ledger) = signed_scenario().await;

    let out = group.store.read_output("o1").await.unwrap().unwrap();
    assert_eq!(out.state, OutputState::Signed);
    assert_eq!(out.trace_id.as_deref(), Some(TRACE));

    let tx = group.store.read_transaction(TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signing);
    let raw = RawTransaction::unmarshal(&tx.raw).unwrap();
    assert_eq!(tx.hash, Some(raw.payload_hash().unwrap()));
    assert_eq!(out.signed_by, raw.payload_hash().unwrap().to_string());

    assert_eq!(raw.inputs.len(), 1);
    assert_eq!(raw.outputs.len(), 2);
    assert_eq!(raw.outputs[0].amount, units("6"));
    assert_eq!(raw.outputs[0].script, threshold_script(1));
    assert_eq!(raw.outputs[1].amount, units("4"));
    assert_eq!(raw.outputs[1].script, threshold_script(2));

    let pack = ExtraPack::decode(&raw.extra).unwrap();
    assert_eq!(pack.trace_id.to_string(), TRACE);
    assert_eq!(pack.memo, "memo");
    assert_eq!(ledger.sign_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_build_transaction_is_idempotent_per_trace() {
    let (group, _ledger) = memory_group(vec![]).await;
    let ledger_outputs = [multisig_utxo("o1", b"deposit", 1_000_000_000, 10)];
    group
        .process_outputs(
            &mut HashSet::new(),
            at(0),
            ledger_outputs
                .iter()
                .cloned()
                .map(|u| Output::from_multisig(u).unwrap())
                .collect(),
        )
        .await
        .unwrap();

    group
        .build_transaction(ASSET, &receivers(), 1, "6", "first", TRACE)
        .await
        .unwrap();
    group
        .build_transaction(ASSET, &receivers(), 1, "2", "second", TRACE)
        .await
        .unwrap();

    let txs = group.store.list_transactions(TransactionState::Initial, 0).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].memo, "first");
    assert_eq!(txs[0].amount, units("6"));
}

#[tokio::test]
async fn test_insufficient_funds_writes_nothing() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_multisig(multisig_utxo("o1", b"deposit", 1_000_000_000, 10));
    group.drain_outputs().await.unwrap();

    let err = group
        .build_transaction(ASSET, &receivers(), 1, "100", "", TRACE)
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::InsufficientFunds { .. }));
    assert!(group.store.read_transaction(TRACE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_build_transaction_validation() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_multisig(multisig_utxo("o1", b"deposit", 1_000_000_000, 10));
    group.drain_outputs().await.unwrap();

    let cases: Vec<(Vec<String>, u8, &str, String, &str)> = vec![
        (receivers(), 0, "1", String::new(), TRACE),
        (receivers(), 2, "1", String::new(), TRACE),
        (receivers(), 1, "0", String::new(), TRACE),
        (receivers(), 1, "abc", String::new(), TRACE),
        (vec!["not-a-uuid".to_string()], 1, "1", String::new(), TRACE),
        (vec![uuid::Uuid::nil().to_string()], 1, "1", String::new(), TRACE),
        (receivers(), 1, "1", "m".repeat(257), TRACE),
        (receivers(), 1, "1", String::new(), "trace"),
    ];
    for (to, threshold, amount, memo, trace) in cases {
        let err = group
            .build_transaction(ASSET, &to, threshold, amount, &memo, trace)
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Validation, "{}", err);
    }
    assert!(group
        .store
        .list_transactions(TransactionState::Initial, 0)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_full_cycle_reaches_snapshot() {
    let (group, ledger) = signed_scenario().await;
    let signed = group.store.read_output("o1").await.unwrap().unwrap();
    let tx = group.store.read_transaction(TRACE).await.unwrap().unwrap();

    // the ledger echoes the partial round, then reports the quorum and the change
    let mut partial = multisig_utxo("o1", b"deposit", 1_000_000_000, 20);
    partial.created_at = at(10);
    partial.state = "signed".to_string();
    partial.signed_tx = signed.signed_tx.clone();
    ledger.push_multisig(partial);

    let mut spent = multisig_utxo("o1", b"deposit", 1_000_000_000, 30);
    spent.created_at = at(10);
    spent.state = "spent".to_string();
    spent.signed_tx = with_quorum(&signed.signed_tx, 2);
    ledger.push_multisig(spent);

    let mut change = multisig_utxo("o2", b"unused", 400_000_000, 30);
    change.transaction_hash = tx.hash.unwrap();
    ledger.push_multisig(change);

    group.drain_outputs().await.unwrap();

    let out = group.store.read_output("o1").await.unwrap().unwrap();
    assert_eq!(out.state, OutputState::Spent);
    let tx = group.store.read_transaction(TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signed);
    assert_eq!(tx.receivers, receivers());
    assert_eq!(tx.memo, "memo");

    // change of our own transaction never reaches the workers
    let actions: Vec<_> = group
        .store
        .list_actions(Stream::Multisig, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.output_id)
        .collect();
    assert_eq!(actions, vec!["o1"]);

    group.publish_transactions().await.unwrap();
    let tx = group.store.read_transaction(TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signed);
    assert_eq!(ledger.broadcast().len(), 1);

    ledger.confirmed.store(true, Ordering::SeqCst);
    group.publish_transactions().await.unwrap();
    let tx = group.store.read_transaction(TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Snapshot);

    // snapshot is terminal, later passes leave it alone
    group.drain_outputs().await.unwrap();
    group.publish_transactions().await.unwrap();
    assert_eq!(ledger.broadcast().len(), 2);
    assert_eq!(group.checkpoint(Stream::Multisig).await.unwrap(), at(30));
}

#[tokio::test]
async fn test_abandoned_round_is_rebuilt() {
    let (group, ledger) = signed_scenario().await;

    let mut reverted = multisig_utxo("o1", b"deposit", 1_000_000_000, 40);
    reverted.created_at = at(10);
    ledger.push_multisig(reverted);
    group.drain_outputs().await.unwrap();

    let out = group.store.read_output("o1").await.unwrap().unwrap();
    assert_eq!(out.state, OutputState::Unspent);
    assert!(out.trace_id.is_none());
    assert!(group.store.list_outputs_for_transaction(TRACE).await.unwrap().is_empty());

    group.sign_transactions().await.unwrap();
    assert_eq!(ledger.sign_calls.load(Ordering::SeqCst), 2);
    let tx = group.store.read_transaction(TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signing);
    let out = group.store.read_output("o1").await.unwrap().unwrap();
    assert_eq!(out.state, OutputState::Signed);
    assert_eq!(out.trace_id.as_deref(), Some(TRACE));
}

#[tokio::test]
async fn test_unfundable_head_is_requeued() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_multisig(multisig_utxo("o1", b"deposit", 1_000_000_000, 10));
    group.drain_outputs().await.unwrap();

    let stuck = Transaction {
        trace_id: FOREIGN_TRACE.to_string(),
        group_id: String::new(),
        asset_id: "drained-asset".to_string(),
        receivers: receivers(),
        threshold: 1,
        amount: units("1"),
        memo: String::new(),
        state: TransactionState::Initial,
        raw: Vec::new(),
        hash: None,
        updated_at: at(1),
    };
    group.store.write_transaction(&stuck).await.unwrap();
    group
        .build_transaction(ASSET, &receivers(), 1, "6", "", TRACE)
        .await
        .unwrap();

    group.sign_transactions().await.unwrap();
    let requeued = group.store.read_transaction(FOREIGN_TRACE).await.unwrap().unwrap();
    assert_eq!(requeued.state, TransactionState::Initial);
    let head = group.store.list_transactions(TransactionState::Initial, 1).await.unwrap();
    assert_eq!(head[0].trace_id, TRACE);

    group.sign_transactions().await.unwrap();
    let tx = group.store.read_transaction(TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signing);
}

#[tokio::test]
async fn test_foreign_round_is_cosigned() {
    let (group, ledger) = memory_group(vec![]).await;
    let mut utxo = multisig_utxo("o1", b"deposit-2", 100_000_000, 10);
    utxo.state = "signed".to_string();
    utxo.signed_tx = foreign_payload(FOREIGN_TRACE);
    ledger.push_multisig(utxo);
    group.drain_outputs().await.unwrap();

    let tx = group.store.read_transaction(FOREIGN_TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Initial);
    assert_eq!(tx.amount, units("1"));
    assert_eq!(tx.threshold, 1);
    assert!(tx.receivers.is_empty());

    group.sign_transactions().await.unwrap();
    assert_eq!(ledger.sign_calls.load(Ordering::SeqCst), 1);
    let tx = group.store.read_transaction(FOREIGN_TRACE).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signing);
    assert_eq!(tx.raw, RawTransaction::decode_signed(&foreign_payload(FOREIGN_TRACE)).unwrap().unwrap().marshal().unwrap());
}

#[tokio::test]
async fn test_abandoned_foreign_round_does_not_delay_local_signing() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_multisig(multisig_utxo("o1", b"deposit", 1_000_000_000, 10));
    let mut utxo = multisig_utxo("o3", b"deposit-2", 100_000_000, 11);
    utxo.state = "signed".to_string();
    utxo.signed_tx = foreign_payload(FOREIGN_TRACE);
    ledger.push_multisig(utxo);
    group.drain_outputs().await.unwrap();
    group.sign_transactions().await.unwrap();
    let foreign = group.store.read_transaction(FOREIGN_TRACE).await.unwrap().unwrap();
    assert_eq!(foreign.state, TransactionState::Signing);

    // the other member abandons its round
    let mut reverted = multisig_utxo("o3", b"deposit-2", 100_000_000, 20);
    reverted.created_at = at(11);
    ledger.push_multisig(reverted);
    group.drain_outputs().await.unwrap();

    group
        .build_transaction(ASSET, &receivers(), 1, "6", "", TRACE)
        .await
        .unwrap();
    group.sign_transactions().await.unwrap();

    let local = group.store.read_transaction(TRACE).await.unwrap().unwrap();
    assert_eq!(local.state, TransactionState::Signing);
    assert_eq!(ledger.sign_calls.load(Ordering::SeqCst), 2);
    let parked = group.store.read_transaction(FOREIGN_TRACE).await.unwrap().unwrap();
    assert_eq!(parked.state, TransactionState::Initial);

    // parked, not rotated through the queue
    group.sign_transactions().await.unwrap();
    let still = group.store.read_transaction(FOREIGN_TRACE).await.unwrap().unwrap();
    assert_eq!(still, parked);
    assert_eq!(ledger.sign_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unknown_output_state_is_fatal() {
    let (group, ledger) = memory_group(vec![]).await;
    let mut utxo = multisig_utxo("o1", b"deposit", 100_000_000, 10);
    utxo.state = "pending".to_string();
    ledger.push_multisig(utxo);

    let err = group.drain_outputs().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(group.checkpoint(Stream::Multisig).await.unwrap(), group.epoch());

    let mut nft = collectible_utxo("c1", "token-1", b"mint-1", 10);
    nft.state = "pending".to_string();
    ledger.push_collectible(nft);
    assert!(group.tick(Stream::Collectible).await.unwrap_err().is_fatal());
}

#[tokio::test]
async fn test_outputs_of_one_transaction_make_one_action() {
    let (group, ledger) = memory_group(vec![]).await;
    let mut first = multisig_utxo("o1", b"same", 100_000_000, 10);
    first.output_index = 0;
    let mut second = multisig_utxo("o2", b"same", 200_000_000, 11);
    second.output_index = 1;
    ledger.push_multisig(first);
    ledger.push_multisig(second);
    group.drain_outputs().await.unwrap();

    assert_eq!(group.store.list_outputs(OutputState::Unspent, 0).await.unwrap().len(), 2);
    let actions = group.store.list_actions(Stream::Multisig, 0).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].output_id, "o1");
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let (group, ledger) = memory_group(vec![]).await;
    let mut utxos: Vec<MultisigUtxo> = vec![
        multisig_utxo("o1", b"t1", 100_000_000, 10),
        multisig_utxo("o2", b"t2", 200_000_000, 11),
    ];
    let mut foreign = multisig_utxo("o3", b"deposit-2", 100_000_000, 12);
    foreign.state = "signed".to_string();
    foreign.signed_tx = foreign_payload(FOREIGN_TRACE);
    utxos.push(foreign);
    for utxo in &utxos {
        ledger.push_multisig(utxo.clone());
    }
    group.drain_outputs().await.unwrap();

    let snapshot = |store: Arc<dyn Store>| async move {
        let mut outputs = store.list_outputs(OutputState::Unspent, 0).await.unwrap();
        outputs.extend(store.list_outputs(OutputState::Signed, 0).await.unwrap());
        let txs = store.list_transactions(TransactionState::Initial, 0).await.unwrap();
        let actions = store.list_actions(Stream::Multisig, 0).await.unwrap();
        (outputs, txs, actions)
    };
    let before = snapshot(group.store()).await;
    assert_eq!(before.0.len(), 3);
    assert_eq!(before.1.len(), 1);
    assert_eq!(before.2.len(), 3);

    // a fresh pass over the same batch, as after a restart from an older checkpoint
    let outputs = utxos
        .into_iter()
        .map(|u| Output::from_multisig(u).unwrap())
        .collect();
    group
        .process_outputs(&mut HashSet::new(), at(0), outputs)
        .await
        .unwrap();
    assert_eq!(snapshot(group.store()).await, before);
}

#[tokio::test]
async fn test_pre_epoch_outputs_are_ignored() {
    let (group, _ledger) = memory_group(vec![]).await;
    let old = Output::from_multisig(multisig_utxo("old", b"old", 100_000_000, -5)).unwrap();
    let checkpoint = group
        .process_outputs(&mut HashSet::new(), at(-10), vec![old])
        .await
        .unwrap();
    assert_eq!(checkpoint, at(-5));
    assert!(group.store.read_output("old").await.unwrap().is_none());
    assert!(group.store.list_actions(Stream::Multisig, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_undecodable_payload_is_fatal() {
    let (group, ledger) = memory_group(vec![]).await;
    let mut utxo = multisig_utxo("o1", b"deposit", 100_000_000, 10);
    utxo.state = "signed".to_string();
    utxo.signed_tx = "zz".to_string();
    ledger.push_multisig(utxo);

    let err = group.drain_outputs().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(group.checkpoint(Stream::Multisig).await.unwrap(), group.epoch());
    assert!(group.store.read_output("o1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_workers_run_once_across_restart() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::memory().await);
    let ledger = Arc::new(FakeLedger::default());
    let first = RecordingWorker::new("refund");
    let second = RecordingWorker::new("mint");
    second.fail.store(true, Ordering::SeqCst);
    let workers: Vec<Arc<dyn Worker>> = vec![first.clone(), second.clone()];

    let group = build_group(store.clone(), ledger.clone(), workers.clone()).await;
    ledger.push_multisig(multisig_utxo("o1", b"t1", 100_000_000, 10));
    ledger.push_multisig(multisig_utxo("o2", b"t2", 100_000_000, 11));
    group.drain_outputs().await.unwrap();

    let err = group.process_actions().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(first.seen(), vec!["o1"]);
    assert!(second.seen().is_empty());
    assert_eq!(
        store.list_action_workers(Stream::Multisig, "o1").await.unwrap(),
        vec!["refund".to_string()]
    );

    // the process restarts against the same store
    second.fail.store(false, Ordering::SeqCst);
    let group = build_group(store.clone(), ledger.clone(), workers.clone()).await;
    group.process_actions().await.unwrap();
    assert_eq!(first.seen(), vec!["o1", "o2"]);
    assert_eq!(second.seen(), vec!["o1", "o2"]);
    assert!(store.list_actions(Stream::Multisig, 0).await.unwrap().is_empty());

    let group = build_group(store.clone(), ledger, workers).await;
    group.drain_outputs().await.unwrap();
    group.process_actions().await.unwrap();
    assert_eq!(first.seen().len(), 2);
    assert_eq!(second.seen().len(), 2);
}

#[tokio::test]
async fn test_collectible_mint_is_content_addressed() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_collectible(collectible_utxo("c1", COLLECTIBLE_META_TOKEN_ID, b"carrier", 10));
    group.drain_collectible_outputs().await.unwrap();

    let nfo = b"collection:token:1".to_vec();
    group.build_collectible_mint_transaction(RECEIVER, &nfo).await.unwrap();
    group.build_collectible_mint_transaction(RECEIVER, &nfo).await.unwrap();
    let txs = group
        .store
        .list_collectible_transactions(TransactionState::Initial, 0)
        .await
        .unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].trace_id, nfo_trace_id(&nfo));
    assert_eq!(txs[0].amount, Amount::MIN);

    group.sign_collectible_transactions().await.unwrap();
    let tx = group
        .store
        .read_collectible_transaction(&nfo_trace_id(&nfo))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.state, TransactionState::Signing);
    let raw = RawTransaction::unmarshal(&tx.raw).unwrap();
    assert_eq!(raw.extra, nfo);
    assert_eq!(raw.outputs.len(), 1);
    assert_eq!(raw.outputs[0].amount, Amount::MIN);

    let carrier = group.store.read_collectible_output("c1").await.unwrap().unwrap();
    assert_eq!(carrier.state, OutputState::Signed);
    assert_eq!(carrier.trace_id, Some(nfo_trace_id(&nfo)));
}

#[tokio::test]
async fn test_mint_without_carrier_is_rejected() {
    let (group, _ledger) = memory_group(vec![]).await;
    let nfo = b"collection:token:2";

    let err = group
        .build_collectible_mint_transaction(RECEIVER, nfo)
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::NoCollectibleCarrier { .. }));
    assert_eq!(err.category(), crate::error::ErrorCategory::Validation);
    assert!(group
        .store
        .read_collectible_transaction(&nfo_trace_id(nfo))
        .await
        .unwrap()
        .is_none());

    let err = group
        .build_collectible_mint_transaction("nobody", b"x")
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::InvalidReceiver(_)));
}

#[tokio::test]
async fn test_mint_requeued_once_carrier_is_taken() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_collectible(collectible_utxo("c1", COLLECTIBLE_META_TOKEN_ID, b"carrier", 10));
    group.drain_collectible_outputs().await.unwrap();

    group.build_collectible_mint_transaction(RECEIVER, b"first").await.unwrap();
    group.build_collectible_mint_transaction(RECEIVER, b"second").await.unwrap();

    group.sign_collectible_transactions().await.unwrap();
    group.sign_collectible_transactions().await.unwrap();
    assert_eq!(ledger.sign_calls.load(Ordering::SeqCst), 1);

    let first = group
        .store
        .read_collectible_transaction(&nfo_trace_id(b"first"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.state, TransactionState::Signing);
    let second = group
        .store
        .read_collectible_transaction(&nfo_trace_id(b"second"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.state, TransactionState::Initial);
}

async fn minted_scenario(nfo: &[u8]) -> (super::Group, Arc<FakeLedger>) {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_collectible(collectible_utxo("c1", COLLECTIBLE_META_TOKEN_ID, b"carrier", 10));
    group.drain_collectible_outputs().await.unwrap();
    group.build_collectible_mint_transaction(RECEIVER, nfo).await.unwrap();
    group.sign_collectible_transactions().await.unwrap();
    (group, ledger)
}

#[tokio::test]
async fn test_collectible_full_cycle_reaches_snapshot() {
    let nfo = b"collection:token:3";
    let trace = nfo_trace_id(nfo);
    let (group, ledger) = minted_scenario(nfo).await;
    let carrier = group.store.read_collectible_output("c1").await.unwrap().unwrap();
    let tx = group.store.read_collectible_transaction(&trace).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signing);

    // partial round echoed by the ledger
    let mut partial = collectible_utxo("c1", COLLECTIBLE_META_TOKEN_ID, b"carrier", 20);
    partial.created_at = at(10);
    partial.state = "signed".to_string();
    partial.signed_tx = carrier.signed_tx.clone();
    ledger.push_collectible(partial);
    group.drain_collectible_outputs().await.unwrap();

    let out = group.store.read_collectible_output("c1").await.unwrap().unwrap();
    assert_eq!(out.state, OutputState::Signed);
    assert_eq!(out.trace_id.as_deref(), Some(trace.as_str()));
    let tx = group.store.read_collectible_transaction(&trace).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signing);

    // quorum reached, the minted token lands with the receiver
    let mut spent = collectible_utxo("c1", COLLECTIBLE_META_TOKEN_ID, b"carrier", 30);
    spent.created_at = at(10);
    spent.state = "spent".to_string();
    spent.signed_tx = with_quorum(&carrier.signed_tx, 2);
    ledger.push_collectible(spent);

    let mut minted = collectible_utxo("m1", "token-3", b"unused", 30);
    minted.transaction_hash = tx.hash.unwrap();
    ledger.push_collectible(minted);

    group.drain_collectible_outputs().await.unwrap();

    let out = group.store.read_collectible_output("c1").await.unwrap().unwrap();
    assert_eq!(out.state, OutputState::Spent);
    let tx = group.store.read_collectible_transaction(&trace).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signed);
    assert_eq!(tx.receivers, receivers());
    assert_eq!(tx.nfo, nfo.to_vec());

    let actions: Vec<_> = group
        .store
        .list_actions(Stream::Collectible, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.output_id)
        .collect();
    assert_eq!(actions, vec!["c1"]);

    group.publish_collectible_transactions().await.unwrap();
    let tx = group.store.read_collectible_transaction(&trace).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signed);

    ledger.confirmed.store(true, Ordering::SeqCst);
    group.publish_collectible_transactions().await.unwrap();
    let tx = group.store.read_collectible_transaction(&trace).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Snapshot);
    assert_eq!(ledger.broadcast().len(), 2);
    assert_eq!(group.checkpoint(Stream::Collectible).await.unwrap(), at(30));
}

#[tokio::test]
async fn test_collectible_abandoned_round_is_rebuilt() {
    let nfo = b"collection:token:4";
    let trace = nfo_trace_id(nfo);
    let (group, ledger) = minted_scenario(nfo).await;

    let mut reverted = collectible_utxo("c1", COLLECTIBLE_META_TOKEN_ID, b"carrier", 40);
    reverted.created_at = at(10);
    ledger.push_collectible(reverted);
    group.drain_collectible_outputs().await.unwrap();

    let carrier = group.store.read_collectible_output("c1").await.unwrap().unwrap();
    assert_eq!(carrier.state, OutputState::Unspent);
    assert!(carrier.trace_id.is_none());
    assert!(group
        .store
        .list_collectible_outputs_for_transaction(&trace)
        .await
        .unwrap()
        .is_empty());

    group.sign_collectible_transactions().await.unwrap();
    assert_eq!(ledger.sign_calls.load(Ordering::SeqCst), 2);
    let tx = group.store.read_collectible_transaction(&trace).await.unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Signing);
    let carrier = group.store.read_collectible_output("c1").await.unwrap().unwrap();
    assert_eq!(carrier.state, OutputState::Signed);
    assert_eq!(carrier.trace_id, Some(trace));
}

#[tokio::test]
async fn test_collectible_actions_reach_workers() {
    let worker = RecordingWorker::new("collector");
    let (group, ledger) = memory_group(vec![worker.clone()]).await;
    ledger.push_collectible(collectible_utxo("c1", "token-1", b"mint-1", 10));
    ledger.push_collectible(collectible_utxo("c2", "token-2", b"mint-2", 11));

    group.tick(Stream::Collectible).await.unwrap();
    assert_eq!(worker.seen(), vec!["c1", "c2"]);
    assert!(group.store.list_actions(Stream::Collectible, 0).await.unwrap().is_empty());
    assert!(group.store.list_actions(Stream::Multisig, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_network_errors_are_retryable() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_multisig(multisig_utxo("o1", b"deposit", 100_000_000, 10));
    ledger.offline.store(true, Ordering::SeqCst);

    let err = group.tick(Stream::Multisig).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(group.store.read_output("o1").await.unwrap().is_none());

    ledger.offline.store(false, Ordering::SeqCst);
    group.tick(Stream::Multisig).await.unwrap();
    assert!(group.store.read_output("o1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_mocked_ledger_failure_leaves_checkpoint() {
    let mut mock = MockLedgerApi::new();
    mock.expect_verify_pin().returning(|_| Ok(()));
    mock.expect_read_multisig_outputs()
        .times(1)
        .returning(|_, _, _, _| Err(GroupError::ledger("/multisigs/outputs", "timed out")));

    let store: Arc<dyn Store> = Arc::new(SqliteStore::memory().await);
    let group = super::Group::build(store, Arc::new(mock), &sample_settings(), vec![])
        .await
        .unwrap();
    let err = group.drain_outputs().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(group.checkpoint(Stream::Multisig).await.unwrap(), group.epoch());
}

#[tokio::test]
async fn test_build_rejects_bad_pin() {
    let mut mock = MockLedgerApi::new();
    mock.expect_verify_pin()
        .returning(|_| Err(GroupError::ledger("/pin/verify", "403 invalid pin")));
    let store: Arc<dyn Store> = Arc::new(SqliteStore::memory().await);
    let result = super::Group::build(store.clone(), Arc::new(mock), &sample_settings(), vec![]).await;
    assert!(result.is_err());
    assert!(store.list_iterations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_build_records_genesis_roster() {
    let (group, _ledger) = memory_group(vec![]).await;
    assert_eq!(group.members(), ["a", "b", "c"]);
    assert_eq!(group.threshold(), 2);
    assert_eq!(group.epoch(), at(0));
    assert_eq!(
        group.genesis_id(),
        Hash::digest(b"abc:2:1700000000000000000").to_string()
    );

    group.add_node("d", 3, at(100)).await.unwrap();
    let (members, threshold, epoch) = group.list_active_nodes().await.unwrap();
    assert_eq!(members, vec!["a", "b", "c", "d"]);
    assert_eq!(threshold, 3);
    assert_eq!(epoch, at(100));
}

#[tokio::test]
async fn test_duplicate_worker_names_rejected() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::memory().await);
    let workers: Vec<Arc<dyn Worker>> =
        vec![RecordingWorker::new("same"), RecordingWorker::new("same")];
    let result = super::Group::build(
        store,
        Arc::new(FakeLedger::default()),
        &sample_settings(),
        workers,
    )
    .await;
    assert!(matches!(result, Err(GroupError::Config(_))));
}

#[tokio::test]
async fn test_run_until_stopped() {
    let (group, ledger) = memory_group(vec![]).await;
    ledger.push_multisig(multisig_utxo("o1", b"deposit", 100_000_000, 10));
    let group = Arc::new(group);
    let handle = tokio::spawn(group.clone().run());

    let mut drained = false;
    for _ in 0..200 {
        if group.store.read_output("o1").await.unwrap().is_some() {
            drained = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(drained);

    group.stop().await;
    let result: GroupResult<()> = handle.await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_stopped_group_skips_network() {
    let (group, ledger) = memory_group(vec![]).await;
    group.stop().await;
    ledger.offline.store(true, Ordering::SeqCst);
    group.tick(Stream::Multisig).await.unwrap();
    group.tick(Stream::Collectible).await.unwrap();
    assert!(group.is_stopped().await);
}
