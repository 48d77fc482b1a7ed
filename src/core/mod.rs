//! Core node subsystems.
//!
//! - `account` / `transaction` / `block`: the ledger data model
//! - `policy`: consensus constants and proof-of-work arithmetic
//! - `chain`: block ingestion, fork choice, and rebranching
//! - `mempool`: the pending-transaction set
//! - `miner`: candidate assembly and the nonce search loop
//! - `events`: the typed streams wiring the subsystems together

pub mod account;
pub mod block;
pub mod chain;
pub mod events;
pub mod mempool;
pub mod miner;
pub mod policy;
pub mod transaction;
