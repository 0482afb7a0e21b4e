//! Trusted Group - threshold-signed custody of ledger outputs
//!
//! A fixed roster of member nodes jointly controls multisig outputs on a remote
//! ledger. Every node independently mirrors the group's outputs, offers new
//! ones to application workers and co-signs outgoing transfers until a quorum
//! of members has signed.

pub mod api;
pub mod config;
pub mod coordination;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod state;
pub mod tx;

pub use coordination::{Group, Worker};
pub use error::{GroupError, GroupResult};
