//! Deterministic in-memory ledger and group fixtures

use super::{Group, Worker};
use crate::config::Settings;
use crate::error::{GroupError, GroupResult};
use crate::ledger::{
    AggregatedSignature, CollectibleUtxo, GhostInput, GhostKeys, LedgerApi, MultisigUtxo,
    RawTransaction, RawTransactionStatus, SignRequest,
};
use crate::model::{Amount, Hash, Output, Stream};
use crate::state::{SqliteStore, Store};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ASSET: &str = "965e5c6e-434c-3fa9-b780-c50f43cd955c";
pub const RECEIVER: &str = "e9e5b807-fa8b-455a-8dfa-b189d28310ff";

/// Ledger time `secs` after the sample genesis
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn multisig_utxo(id: &str, origin: &[u8], units: u64, secs: i64) -> MultisigUtxo {
    MultisigUtxo {
        utxo_id: id.to_string(),
        asset_id: ASSET.to_string(),
        transaction_hash: Hash::digest(origin),
        output_index: 0,
        sender: String::new(),
        amount: Amount::from_units(units),
        threshold: 2,
        members: vec!["a".into(), "b".into(), "c".into()],
        memo: String::new(),
        state: "unspent".to_string(),
        created_at: at(secs),
        updated_at: at(secs),
        signed_by: String::new(),
        signed_tx: String::new(),
    }
}

pub fn collectible_utxo(id: &str, token_id: &str, origin: &[u8], secs: i64) -> CollectibleUtxo {
    CollectibleUtxo {
        output_id: id.to_string(),
        token_id: token_id.to_string(),
        transaction_hash: Hash::digest(origin),
        output_index: 0,
        amount: Amount::MIN,
        senders_threshold: 1,
        senders: vec![RECEIVER.to_string()],
        receivers_threshold: 2,
        receivers: vec!["a".into(), "b".into(), "c".into()],
        memo: String::new(),
        state: "unspent".to_string(),
        created_at: at(secs),
        updated_at: at(secs),
        signed_by: String::new(),
        signed_tx: String::new(),
    }
}

/// Attach a quorum of signatures to a hex payload
pub fn with_quorum(signed_tx: &str, signers: u16) -> String {
    let mut raw = RawTransaction::decode_signed(signed_tx).unwrap().unwrap();
    raw.aggregated_signature = Some(AggregatedSignature {
        signers: (0..signers).collect(),
        signature: vec![1; 64],
    });
    raw.to_hex().unwrap()
}

/// Ledger that serves whatever outputs a test pushes into it
#[derive(Default)]
pub struct FakeLedger {
    multisig: Mutex<Vec<MultisigUtxo>>,
    collectibles: Mutex<Vec<CollectibleUtxo>>,
    requests: Mutex<HashMap<String, String>>,
    broadcast: Mutex<Vec<Hash>>,
    pub sign_calls: AtomicUsize,
    pub confirmed: AtomicBool,
    pub offline: AtomicBool,
}

impl FakeLedger {
    pub fn push_multisig(&self, utxo: MultisigUtxo) {
        self.multisig.lock().unwrap().push(utxo);
    }

    pub fn push_collectible(&self, utxo: CollectibleUtxo) {
        self.collectibles.lock().unwrap().push(utxo);
    }

    pub fn broadcast(&self) -> Vec<Hash> {
        self.broadcast.lock().unwrap().clone()
    }

    fn check_online(&self) -> GroupResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GroupError::ledger("fake", "connection refused"));
        }
        Ok(())
    }

    fn page<T: Clone>(
        items: &[T],
        updated_at: impl Fn(&T) -> DateTime<Utc>,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> Vec<T> {
        let mut page: Vec<T> = items
            .iter()
            .filter(|u| updated_at(u) >= offset)
            .cloned()
            .collect();
        page.sort_by_key(|u| updated_at(u));
        page.truncate(limit);
        page
    }
}

#[async_trait]
impl LedgerApi for FakeLedger {
    async fn verify_pin(&self, _pin: &str) -> GroupResult<()> {
        self.check_online()
    }

    async fn read_multisig_outputs(
        &self,
        _members: &[String],
        _threshold: u8,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> GroupResult<Vec<MultisigUtxo>> {
        self.check_online()?;
        let items = self.multisig.lock().unwrap();
        Ok(Self::page(&items, |u| u.updated_at, offset, limit))
    }

    async fn read_collectible_outputs(
        &self,
        _members: &[String],
        _threshold: u8,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleUtxo>> {
        self.check_online()?;
        let items = self.collectibles.lock().unwrap();
        Ok(Self::page(&items, |u| u.updated_at, offset, limit))
    }

    async fn read_ghost_keys(&self, inputs: Vec<GhostInput>) -> GroupResult<Vec<GhostKeys>> {
        self.check_online()?;
        Ok(inputs
            .into_iter()
            .map(|input| GhostKeys {
                keys: input
                    .receivers
                    .iter()
                    .map(|r| Hash::digest(format!("{}:{}:{}", r, input.hint, input.index).as_bytes()).to_string())
                    .collect(),
                mask: Hash::digest(format!("{}:{}", input.hint, input.index).as_bytes()).to_string(),
            })
            .collect())
    }

    async fn create_sign_request(&self, _stream: Stream, raw: &str) -> GroupResult<SignRequest> {
        self.check_online()?;
        let mut requests = self.requests.lock().unwrap();
        let request_id = format!("request-{}", requests.len());
        requests.insert(request_id.clone(), raw.to_string());
        Ok(SignRequest {
            request_id,
            raw_transaction: raw.to_string(),
        })
    }

    async fn sign_request(
        &self,
        _stream: Stream,
        request_id: &str,
        _pin: &str,
    ) -> GroupResult<SignRequest> {
        self.check_online()?;
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let raw = self
            .requests
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .ok_or_else(|| GroupError::ledger("fake", "unknown request"))?;
        Ok(SignRequest {
            request_id: request_id.to_string(),
            raw_transaction: raw,
        })
    }

    async fn send_raw_transaction(&self, raw: &str) -> GroupResult<Hash> {
        self.check_online()?;
        let tx = RawTransaction::decode_signed(raw)?
            .ok_or_else(|| GroupError::ledger("fake", "empty raw"))?;
        let hash = tx.payload_hash()?;
        self.broadcast.lock().unwrap().push(hash);
        Ok(hash)
    }

    async fn get_raw_transaction(&self, hash: Hash) -> GroupResult<RawTransactionStatus> {
        self.check_online()?;
        let snapshot = self
            .confirmed
            .load(Ordering::SeqCst)
            .then(|| format!("snapshot-{}", hash));
        Ok(RawTransactionStatus { hash, snapshot })
    }
}

/// Worker that records every output it sees
pub struct RecordingWorker {
    name: String,
    pub seen: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingWorker {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            seen: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_output(&self, _group: &Group, output: &Output) -> GroupResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GroupError::InvalidReceiver(output.output_id.clone()));
        }
        self.seen.lock().unwrap().push(output.output_id.clone());
        Ok(())
    }

    async fn process_collectible_output(
        &self,
        _group: &Group,
        output: &crate::model::CollectibleOutput,
    ) -> GroupResult<()> {
        self.seen.lock().unwrap().push(output.output_id.clone());
        Ok(())
    }
}

pub fn sample_settings() -> Settings {
    let mut settings = Settings::parse(crate::config::tests::SAMPLE).unwrap();
    settings.coordinator.drain_batch_size = 4;
    settings.coordinator.poll_interval_ms = 10;
    settings.coordinator.retry_delay_ms = 10;
    settings
}

pub async fn build_group(
    store: Arc<dyn Store>,
    ledger: Arc<FakeLedger>,
    workers: Vec<Arc<dyn Worker>>,
) -> Group {
    Group::build(store, ledger, &sample_settings(), workers).await.unwrap()
}

pub async fn memory_group(workers: Vec<Arc<dyn Worker>>) -> (Group, Arc<FakeLedger>) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::memory().await);
    let ledger = Arc::new(FakeLedger::default());
    let group = build_group(store, ledger.clone(), workers).await;
    (group, ledger)
}
