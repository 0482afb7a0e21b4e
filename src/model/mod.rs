//! Group state entities and their lifecycle rules
//!
//! All timestamps are ledger timestamps in UTC. State enums are ordered so that
//! `a < b` means `b` is further along the lifecycle.

pub mod action;
pub mod collectible;
pub mod iteration;
pub mod output;
pub mod transaction;

pub use action::{Action, ActionState};
pub use collectible::{CollectibleOutput, CollectibleTransaction};
pub use iteration::{Iteration, IterationAction};
pub use output::{Output, OutputState};
pub use transaction::{Transaction, TransactionState};

use crate::error::{GroupError, GroupResult};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::str::FromStr;

/// Number of decimal places carried by ledger amounts
pub const AMOUNT_PRECISION: u32 = 8;

const UNITS_PER_WHOLE: u64 = 100_000_000;

/// Fixed-point ledger amount counted in the smallest unit (1e-8)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    /// The smallest transferable quantity
    pub const MIN: Amount = Amount(1);

    pub fn from_units(units: u64) -> Self {
        Amount(units)
    }

    pub fn units(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl FromStr for Amount {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GroupError::InvalidAmount(s.to_string());
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > AMOUNT_PRECISION as usize {
            return Err(invalid());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut frac_units: u64 = 0;
        for (i, b) in frac.bytes().enumerate() {
            frac_units += u64::from(b - b'0') * 10u64.pow(AMOUNT_PRECISION - 1 - i as u32);
        }

        whole
            .checked_mul(UNITS_PER_WHOLE)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNITS_PER_WHOLE;
        let frac = self.0 % UNITS_PER_WHOLE;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let frac = format!("{:08}", frac);
        write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 32-byte ledger hash, hex on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// SHA3-256 of arbitrary bytes
    pub fn digest(data: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha3_256::digest(data));
        Hash(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| GroupError::ledger("hash", e))?;
        if bytes.len() != 32 {
            return Err(GroupError::ledger("hash", format!("invalid length {}", bytes.len())));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The two independently drained output pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    Multisig,
    Collectible,
}

impl Stream {
    pub fn label(&self) -> &'static str {
        match self {
            Stream::Multisig => "multisig",
            Stream::Collectible => "collectible",
        }
    }
}

/// Parse a ledger UTXO state name
pub(crate) fn parse_output_state(name: &str) -> GroupResult<OutputState> {
    match name {
        "unspent" => Ok(OutputState::Unspent),
        "signed" => Ok(OutputState::Signed),
        "spent" => Ok(OutputState::Spent),
        other => Err(GroupError::fatal(format!("unknown output state {}", other))),
    }
}
