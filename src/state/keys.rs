//! Keyspace layout
//!
//! Secondary index keys are `prefix | discriminant: | ts (8 bytes BE nanos) | id`
//! so a prefix scan returns entries in ascending time order. Collectible
//! entities live under the same layout rooted at `COLLECTIBLES:`.

use crate::model::{ActionState, Hash, OutputState, Stream, TransactionState};

use chrono::{DateTime, TimeZone, Utc};

pub const OUTPUTS_CHECKPOINT_KEY: &str = "outputs-draining-checkpoint";
pub const COLLECTIBLES_CHECKPOINT_KEY: &str = "collectibles-draining-checkpoint";
pub const CLOCK_PROPERTY_KEY: &str = "MTG:GROUP:CLOCK:MONOTONIC";

const PROPERTY_PREFIX: &str = "PROPERTY:";
const ITERATION_PAYLOAD: &str = "ITERATION:PAYLOAD:";
const ITERATION_QUEUE: &str = "ITERATION:QUEUE:";

/// Big-endian nanoseconds, pre-epoch times clamp to zero
pub fn ts_bytes(ts: DateTime<Utc>) -> [u8; 8] {
    let nanos = ts.timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
    nanos.to_be_bytes()
}

pub fn ts_from_bytes(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    let nanos = u64::from_be_bytes(arr);
    Some(Utc.timestamp_nanos(nanos as i64))
}

/// Smallest key greater than every key starting with `prefix`
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // all 0xff, scan to the end of the keyspace
    vec![u8::MAX; prefix.len() + 1]
}

pub fn property(key: &str) -> Vec<u8> {
    format!("{}{}", PROPERTY_PREFIX, key).into_bytes()
}

pub fn iteration_payload(node_id: &str) -> Vec<u8> {
    format!("{}{}", ITERATION_PAYLOAD, node_id).into_bytes()
}

pub fn iteration_queue_prefix() -> Vec<u8> {
    ITERATION_QUEUE.as_bytes().to_vec()
}

pub fn iteration_queue(ts: DateTime<Utc>, node_id: &str) -> Vec<u8> {
    timed(iteration_queue_prefix(), ts, node_id)
}

fn timed(mut prefix: Vec<u8>, ts: DateTime<Utc>, id: &str) -> Vec<u8> {
    prefix.extend_from_slice(&ts_bytes(ts));
    prefix.extend_from_slice(id.as_bytes());
    prefix
}

/// Per-stream key builders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyspace {
    root: &'static str,
}

impl Keyspace {
    pub const MULTISIG: Keyspace = Keyspace { root: "" };
    pub const COLLECTIBLE: Keyspace = Keyspace { root: "COLLECTIBLES:" };

    pub fn of(stream: Stream) -> Keyspace {
        match stream {
            Stream::Multisig => Self::MULTISIG,
            Stream::Collectible => Self::COLLECTIBLE,
        }
    }

    fn key(&self, parts: &[&str]) -> Vec<u8> {
        let mut key = self.root.as_bytes().to_vec();
        for part in parts {
            key.extend_from_slice(part.as_bytes());
        }
        key
    }

    pub fn output_payload(&self, id: &str) -> Vec<u8> {
        self.key(&["OUTPUT:PAYLOAD:", id])
    }

    pub fn output_state_prefix(&self, state: OutputState) -> Vec<u8> {
        self.key(&["OUTPUT:STATE:", state.name(), ":"])
    }

    pub fn output_state(&self, state: OutputState, ts: DateTime<Utc>, id: &str) -> Vec<u8> {
        timed(self.output_state_prefix(state), ts, id)
    }

    pub fn output_asset_prefix(&self, state: OutputState, asset: &str) -> Vec<u8> {
        self.key(&["OUTPUT:ASSET:", state.name(), ":", asset, ":"])
    }

    pub fn output_asset(
        &self,
        state: OutputState,
        asset: &str,
        ts: DateTime<Utc>,
        id: &str,
    ) -> Vec<u8> {
        timed(self.output_asset_prefix(state, asset), ts, id)
    }

    pub fn output_transaction_prefix(&self, trace_id: &str) -> Vec<u8> {
        self.key(&["OUTPUT:TRANSACTION:", trace_id, ":"])
    }

    pub fn output_transaction(&self, trace_id: &str, ts: DateTime<Utc>, id: &str) -> Vec<u8> {
        timed(self.output_transaction_prefix(trace_id), ts, id)
    }

    pub fn transaction_payload(&self, trace_id: &str) -> Vec<u8> {
        self.key(&["TRANSACTION:PAYLOAD:", trace_id])
    }

    pub fn transaction_state_prefix(&self, state: TransactionState) -> Vec<u8> {
        self.key(&["TRANSACTION:STATE:", state.name(), ":"])
    }

    pub fn transaction_state(
        &self,
        state: TransactionState,
        ts: DateTime<Utc>,
        trace_id: &str,
    ) -> Vec<u8> {
        timed(self.transaction_state_prefix(state), ts, trace_id)
    }

    pub fn transaction_hash(&self, hash: &Hash) -> Vec<u8> {
        self.key(&["TRANSACTION:HASH:", &hash.to_string()])
    }

    pub fn action_payload(&self, output_id: &str) -> Vec<u8> {
        self.key(&["ACTION:PAYLOAD:", output_id])
    }

    pub fn action_state_prefix(&self, state: ActionState) -> Vec<u8> {
        self.key(&["ACTION:STATE:", state.name(), ":"])
    }

    pub fn action_state(&self, state: ActionState, ts: DateTime<Utc>, output_id: &str) -> Vec<u8> {
        timed(self.action_state_prefix(state), ts, output_id)
    }

    pub fn action_hash(&self, hash: &Hash) -> Vec<u8> {
        self.key(&["ACTION:HASH:", &hash.to_string()])
    }

    pub fn action_worker_prefix(&self, output_id: &str) -> Vec<u8> {
        self.key(&["ACTION:WORKER:", output_id, ":"])
    }

    pub fn action_worker(&self, output_id: &str, worker: &str) -> Vec<u8> {
        self.key(&["ACTION:WORKER:", output_id, ":", worker])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_keys_sort_by_time() {
        let ks = Keyspace::MULTISIG;
        let early = Utc.timestamp_opt(1_000, 0).unwrap();
        let late = Utc.timestamp_opt(2_000, 0).unwrap();
        let a = ks.output_state(OutputState::Unspent, early, "zzz");
        let b = ks.output_state(OutputState::Unspent, late, "aaa");
        assert!(a < b);
        assert!(a.starts_with(&ks.output_state_prefix(OutputState::Unspent)));
    }

    #[test]
    fn test_collectible_keys_are_disjoint() {
        let a = Keyspace::MULTISIG.output_payload("x");
        let b = Keyspace::COLLECTIBLE.output_payload("x");
        assert_ne!(a, b);
        assert!(!b.starts_with(b"OUTPUT:"));
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab:"), b"ab;".to_vec());
        assert_eq!(prefix_end(&[0x01, 0xff]), vec![0x02]);
        let key = Keyspace::MULTISIG.action_worker("out", "refund");
        let prefix = Keyspace::MULTISIG.action_worker_prefix("out");
        assert!(key >= prefix && key < prefix_end(&prefix));
    }

    #[test]
    fn test_ts_bytes_round_trip() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123).unwrap();
        assert_eq!(ts_from_bytes(&ts_bytes(ts)), Some(ts));
        assert_eq!(ts_from_bytes(b"short"), None);
    }
}
