//! Ledger API client with multi-endpoint failover

use super::{
    hash_members, CollectibleUtxo, GhostInput, GhostKeys, LedgerApi, MultisigUtxo,
    RawTransactionStatus, SignRequest,
};
use crate::config::LedgerConfig;
use crate::error::{GroupError, GroupResult};
use crate::model::{Hash, Stream};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    description: String,
}

#[derive(Debug, Deserialize)]
struct SentTransaction {
    hash: Hash,
}

/// HTTP ledger client, rotating to the next endpoint on transport failure
pub struct HttpLedgerClient {
    config: LedgerConfig,
    client: reqwest::Client,
    /// Current active endpoint index
    current_endpoint: AtomicUsize,
    /// Ghost keys are deterministic per (receivers, index, hint)
    ghost_cache: DashMap<GhostInput, GhostKeys>,
}

impl HttpLedgerClient {
    pub fn new(config: LedgerConfig) -> GroupResult<Self> {
        if config.api_urls.is_empty() {
            return Err(GroupError::Config("No ledger API endpoints".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GroupError::Config(format!("Invalid HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            current_endpoint: AtomicUsize::new(0),
            ghost_cache: DashMap::new(),
        })
    }

    fn endpoint(&self) -> &str {
        let idx = self.current_endpoint.load(Ordering::Relaxed);
        &self.config.api_urls[idx % self.config.api_urls.len()]
    }

    /// Switch to next available endpoint
    fn failover(&self) {
        let current = self.current_endpoint.load(Ordering::Relaxed);
        let next = (current + 1) % self.config.api_urls.len();
        self.current_endpoint.store(next, Ordering::Relaxed);
        warn!(endpoint = %self.endpoint(), "Ledger API failover");
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> GroupResult<T> {
        self.request(reqwest::Method::GET, path, query, None::<&()>).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> GroupResult<T> {
        self.request(reqwest::Method::POST, path, &[], Some(body)).await
    }

    async fn request<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> GroupResult<T> {
        let mut last_error = None;

        for _ in 0..self.config.api_urls.len() {
            let url = format!("{}{}", self.endpoint().trim_end_matches('/'), path);
            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.config.access_token)
                .query(query);
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    last_error = Some(GroupError::Timeout {
                        operation: format!("{} {}", method, path),
                    });
                    self.failover();
                    continue;
                }
                Err(e) => {
                    warn!(url = %url, "Ledger API request failed: {}", e);
                    last_error = Some(GroupError::ledger(path, e));
                    self.failover();
                    continue;
                }
            };

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                return Err(GroupError::RateLimited {
                    endpoint: path.to_string(),
                });
            }
            if resp.status().is_server_error() {
                last_error = Some(GroupError::ledger(path, resp.status()));
                self.failover();
                continue;
            }

            let envelope: Envelope<T> = resp
                .json()
                .await
                .map_err(|e| GroupError::ledger(path, format!("invalid response: {}", e)))?;
            if let Some(err) = envelope.error {
                return Err(GroupError::ledger(
                    path,
                    format!("{} {}", err.code, err.description),
                ));
            }
            debug!(url = %url, "Ledger API request ok");
            return envelope
                .data
                .ok_or_else(|| GroupError::ledger(path, "empty response"));
        }

        Err(last_error.unwrap_or_else(|| GroupError::ledger(path, "All endpoints failed")))
    }

    fn output_query(
        members: &[String],
        threshold: u8,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> GroupResult<Vec<(&'static str, String)>> {
        if threshold < 1 || usize::from(threshold) > members.len() {
            return Err(GroupError::Config(format!(
                "invalid members {}/{}",
                threshold,
                members.len()
            )));
        }
        let mut query = vec![
            ("members", hash_members(members)),
            ("threshold", threshold.to_string()),
            ("offset", offset.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        ];
        if limit > 0 {
            query.push(("limit", limit.to_string()));
        }
        Ok(query)
    }

    fn requests_path(stream: Stream) -> &'static str {
        match stream {
            Stream::Multisig => "/multisigs/requests",
            Stream::Collectible => "/collectibles/requests",
        }
    }
}

#[async_trait]
impl LedgerApi for HttpLedgerClient {
    async fn verify_pin(&self, pin: &str) -> GroupResult<()> {
        let _: serde_json::Value = self.post("/pin/verify", &json!({ "pin": pin })).await?;
        Ok(())
    }

    async fn read_multisig_outputs(
        &self,
        members: &[String],
        threshold: u8,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> GroupResult<Vec<MultisigUtxo>> {
        let query = Self::output_query(members, threshold, offset, limit)?;
        self.get("/multisigs/outputs", &query).await
    }

    async fn read_collectible_outputs(
        &self,
        members: &[String],
        threshold: u8,
        offset: DateTime<Utc>,
        limit: usize,
    ) -> GroupResult<Vec<CollectibleUtxo>> {
        let query = Self::output_query(members, threshold, offset, limit)?;
        self.get("/collectibles/outputs", &query).await
    }

    async fn read_ghost_keys(&self, inputs: Vec<GhostInput>) -> GroupResult<Vec<GhostKeys>> {
        let missing: Vec<GhostInput> = inputs
            .iter()
            .filter(|input| !self.ghost_cache.contains_key(*input))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let keys: Vec<GhostKeys> = self.post("/outputs", &missing).await?;
            if keys.len() != missing.len() {
                return Err(GroupError::ledger(
                    "/outputs",
                    format!("expected {} ghost keys, got {}", missing.len(), keys.len()),
                ));
            }
            for (input, key) in missing.into_iter().zip(keys) {
                self.ghost_cache.insert(input, key);
            }
        }

        inputs
            .iter()
            .map(|input| {
                self.ghost_cache
                    .get(input)
                    .map(|k| k.clone())
                    .ok_or_else(|| GroupError::ledger("/outputs", "ghost key missing"))
            })
            .collect()
    }

    async fn create_sign_request(&self, stream: Stream, raw: &str) -> GroupResult<SignRequest> {
        self.post(
            Self::requests_path(stream),
            &json!({ "action": "sign", "raw": raw }),
        )
        .await
    }

    async fn sign_request(
        &self,
        stream: Stream,
        request_id: &str,
        pin: &str,
    ) -> GroupResult<SignRequest> {
        let path = format!("{}/{}/sign", Self::requests_path(stream), request_id);
        self.post(&path, &json!({ "pin": pin })).await
    }

    async fn send_raw_transaction(&self, raw: &str) -> GroupResult<Hash> {
        let sent: SentTransaction = self
            .post(
                "/external/proxy",
                &json!({ "method": "sendrawtransaction", "params": [raw] }),
            )
            .await?;
        Ok(sent.hash)
    }

    async fn get_raw_transaction(&self, hash: Hash) -> GroupResult<RawTransactionStatus> {
        self.post(
            "/external/proxy",
            &json!({ "method": "getrawtransaction", "params": [hash.to_string()] }),
        )
        .await
    }
}
