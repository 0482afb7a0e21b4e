//! Raw ledger transaction encoding
//!
//! Transactions travel as hex of a bincode payload. The payload hash covers
//! everything except the aggregated signature, so it is stable across signing
//! rounds of the same transaction.

use crate::error::{GroupError, GroupResult};
use crate::ledger::GhostKeys;
use crate::model::{Amount, Hash};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum encoded size of a transaction extra field
pub const EXTRA_SIZE_LIMIT: usize = 256;

pub const TX_VERSION: u8 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    pub hash: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutput {
    pub amount: Amount,
    pub keys: Vec<String>,
    pub mask: String,
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSignature {
    pub signers: Vec<u16>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub version: u8,
    pub asset: Hash,
    pub inputs: Vec<RawInput>,
    pub outputs: Vec<RawOutput>,
    pub extra: Vec<u8>,
    pub aggregated_signature: Option<AggregatedSignature>,
}

impl RawTransaction {
    pub fn new(asset: Hash) -> Self {
        Self {
            version: TX_VERSION,
            asset,
            inputs: Vec::new(),
            outputs: Vec::new(),
            extra: Vec::new(),
            aggregated_signature: None,
        }
    }

    pub fn add_input(&mut self, hash: Hash, index: u32) {
        self.inputs.push(RawInput { hash, index });
    }

    pub fn marshal(&self) -> GroupResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn unmarshal(bytes: &[u8]) -> GroupResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_hex(&self) -> GroupResult<String> {
        Ok(hex::encode(self.marshal()?))
    }

    /// Decode a signed payload attached to a group output
    ///
    /// An empty payload means no signing round has started. Anything else that
    /// fails to decode is corruption and is reported as fatal.
    pub fn decode_signed(signed_tx: &str) -> GroupResult<Option<Self>> {
        if signed_tx.is_empty() {
            return Ok(None);
        }
        let bytes = hex::decode(signed_tx).map_err(|e| {
            GroupError::fatal(format!("undecodable signed payload {}: {}", signed_tx, e))
        })?;
        let tx = bincode::deserialize(&bytes).map_err(|e| {
            GroupError::fatal(format!("undecodable signed payload {}: {}", signed_tx, e))
        })?;
        Ok(Some(tx))
    }

    pub fn payload_hash(&self) -> GroupResult<Hash> {
        let payload = RawTransaction {
            aggregated_signature: None,
            ..self.clone()
        };
        Ok(Hash::digest(&payload.marshal()?))
    }

    /// True once the network aggregated at least `threshold` signatures
    pub fn meets_quorum(&self, threshold: u8) -> bool {
        self.aggregated_signature
            .as_ref()
            .map(|sig| sig.signers.len() >= usize::from(threshold))
            .unwrap_or(false)
    }
}

/// Script requiring `threshold` of the output keys
pub fn threshold_script(threshold: u8) -> String {
    format!("fffe{:02x}", threshold)
}

/// Inverse of [`threshold_script`]
pub fn script_threshold(script: &str) -> Option<u8> {
    let hex = script.strip_prefix("fffe")?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

impl GhostKeys {
    pub fn dump_output(&self, threshold: u8, amount: Amount) -> RawOutput {
        RawOutput {
            amount,
            keys: self.keys.clone(),
            mask: self.mask.clone(),
            script: threshold_script(threshold),
        }
    }
}

/// Application payload carried by every fungible group transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraPack {
    pub trace_id: Uuid,
    pub group_id: String,
    pub memo: String,
}

impl ExtraPack {
    fn encode(&self) -> GroupResult<String> {
        Ok(URL_SAFE_NO_PAD.encode(bincode::serialize(self)?))
    }

    /// Encode the trace id and memo, dropping the memo if the result would not fit
    pub fn encode_bounded(trace_id: &str, group_id: &str, memo: &str) -> GroupResult<String> {
        let trace_id =
            Uuid::parse_str(trace_id).map_err(|_| GroupError::InvalidTraceId(trace_id.to_string()))?;
        if trace_id.is_nil() {
            return Err(GroupError::InvalidTraceId(trace_id.to_string()));
        }
        let mut pack = ExtraPack {
            trace_id,
            group_id: group_id.to_string(),
            memo: memo.to_string(),
        };
        let encoded = pack.encode()?;
        if encoded.len() < EXTRA_SIZE_LIMIT {
            return Ok(encoded);
        }

        pack.memo.clear();
        let encoded = pack.encode()?;
        if encoded.len() < EXTRA_SIZE_LIMIT {
            return Ok(encoded);
        }
        Err(GroupError::MemoTooLarge {
            size: encoded.len(),
            limit: EXTRA_SIZE_LIMIT,
        })
    }

    pub fn decode(extra: &[u8]) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(extra).ok()?;
        let pack: ExtraPack = bincode::deserialize(&bytes).ok()?;
        if pack.trace_id.is_nil() {
            return None;
        }
        Some(pack)
    }
}
