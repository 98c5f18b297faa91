//! Ledger consensus crate.
//!
//! This crate provides the per-node transaction consensus engine used by
//! ledger_node. Higher layers supply a `PersistenceStore`, a
//! `NetworkTransport` and a `SignatureVerifier`, then drive transactions
//! through `LedgerEngine`.

pub mod consensus;
pub mod contracts;
