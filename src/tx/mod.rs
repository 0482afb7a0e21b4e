//! Outgoing transactions: request validation, raw assembly, threshold signing
//! and publishing

mod builder;
mod sender;
mod signer;

pub use builder::MAX_MEMO_SIZE;
