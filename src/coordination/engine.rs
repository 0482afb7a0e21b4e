//! Group coordinator and its two processing loops

use super::checkpoint::read_checkpoint;
use super::clock::MonotonicClock;
use super::iteration::{active_nodes, generate_genesis_id, record_iteration};
use super::Worker;
use crate::config::{CoordinatorConfig, Settings};
use crate::error::{GroupError, GroupResult};
use crate::ledger::LedgerApi;
use crate::model::{IterationAction, Stream};
use crate::state::Store;

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// One member node of a trusted group
pub struct Group {
    /// Shared state store
    pub(crate) store: Arc<dyn Store>,
    /// Remote ledger network
    pub(crate) ledger: Arc<dyn LedgerApi>,
    /// Workers in dispatch order
    pub(crate) workers: Vec<Arc<dyn Worker>>,
    pub(crate) config: CoordinatorConfig,
    pub(crate) clock: MonotonicClock,
    id: String,
    pub(crate) members: Vec<String>,
    pub(crate) threshold: u8,
    pub(crate) epoch: DateTime<Utc>,
    pub(crate) pin: String,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl Group {
    /// Build the group from its genesis configuration
    ///
    /// Verifies the PIN with the ledger, records the genesis roster and loads
    /// the active one.
    pub async fn build(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerApi>,
        settings: &Settings,
        workers: Vec<Arc<dyn Worker>>,
    ) -> GroupResult<Self> {
        let genesis = &settings.genesis;
        if genesis.threshold < 1 || usize::from(genesis.threshold) > genesis.members.len() {
            return Err(GroupError::Config(format!(
                "invalid group threshold {} {}",
                genesis.members.len(),
                genesis.threshold
            )));
        }
        if !genesis.members.contains(&settings.app.client_id) {
            return Err(GroupError::Config(format!(
                "app {} not belongs to the group",
                settings.app.client_id
            )));
        }
        let mut names = HashSet::new();
        for worker in &workers {
            if !names.insert(worker.name().to_string()) {
                return Err(GroupError::Config(format!("duplicate worker {}", worker.name())));
            }
        }

        ledger.verify_pin(&settings.app.pin).await?;

        let genesis_at = Utc.timestamp_nanos(genesis.timestamp);
        for member in &genesis.members {
            record_iteration(
                &*store,
                IterationAction::Add,
                member,
                genesis.threshold,
                genesis_at,
            )
            .await?;
        }
        let (members, threshold, epoch) = active_nodes(&*store).await?;
        let clock = MonotonicClock::restore(store.clone()).await?;

        let group = Self {
            store,
            ledger,
            workers,
            config: settings.coordinator.clone(),
            clock,
            id: generate_genesis_id(genesis),
            members,
            threshold,
            epoch,
            pin: settings.app.pin.clone(),
            shutdown: Arc::new(RwLock::new(false)),
        };
        info!(
            group_id = %group.id,
            members = group.members.len(),
            threshold = group.threshold,
            epoch = %group.epoch,
            "Group built"
        );
        Ok(group)
    }

    pub fn genesis_id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Persisted draining checkpoint of `stream`
    pub async fn checkpoint(&self, stream: Stream) -> GroupResult<DateTime<Utc>> {
        read_checkpoint(&*self.store, stream, self.epoch).await
    }

    /// Run both stream loops until stopped or a fatal error
    pub async fn run(self: Arc<Self>) -> GroupResult<()> {
        info!(group_id = %self.id, "Group started");

        let multisig = spawn_loop(self.clone(), Stream::Multisig);
        let collectible = spawn_loop(self.clone(), Stream::Collectible);
        tokio::try_join!(join_loop(multisig), join_loop(collectible))?;

        info!(group_id = %self.id, "Group stopped");
        Ok(())
    }

    async fn run_loop(&self, stream: Stream) -> GroupResult<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        info!(stream = stream.label(), "Processing loop started");

        loop {
            if self.is_stopped().await {
                break;
            }

            match self.tick(stream).await {
                Ok(()) => sleep(poll_interval).await,
                Err(e) if e.is_fatal() => {
                    error!(stream = stream.label(), "Invariant violation, halting: {}", e);
                    self.stop().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(stream = stream.label(), "Processing error, retrying: {}", e);
                    crate::metrics::record_retry(stream);
                    sleep(retry_delay).await;
                }
            }
        }

        info!(stream = stream.label(), "Processing loop stopped");
        Ok(())
    }

    /// One pass of drain, dispatch, sign and publish
    pub(crate) async fn tick(&self, stream: Stream) -> GroupResult<()> {
        match stream {
            Stream::Multisig => {
                self.drain_outputs().await?;
                self.process_actions().await?;
                if self.is_stopped().await {
                    return Ok(());
                }
                self.sign_transactions().await?;
                self.publish_transactions().await
            }
            Stream::Collectible => {
                self.drain_collectible_outputs().await?;
                self.process_collectible_actions().await?;
                if self.is_stopped().await {
                    return Ok(());
                }
                self.sign_collectible_transactions().await?;
                self.publish_collectible_transactions().await
            }
        }
    }

    /// Stop both loops before their next network call
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Group shutdown initiated");
    }

    pub async fn is_stopped(&self) -> bool {
        *self.shutdown.read().await
    }
}

fn spawn_loop(group: Arc<Group>, stream: Stream) -> JoinHandle<GroupResult<()>> {
    tokio::spawn(async move { group.run_loop(stream).await })
}

async fn join_loop(handle: JoinHandle<GroupResult<()>>) -> GroupResult<()> {
    handle
        .await
        .map_err(|e| GroupError::fatal(format!("processing loop aborted: {}", e)))?
}
