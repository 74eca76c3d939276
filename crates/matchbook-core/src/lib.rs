// Copyright (c) 2026 Matchbook Contributors
// SPDX-License-Identifier: Apache-2.0

//! matchbook-core
//!
//! Privacy-preserving ad-conversion attribution matching: given a
//! pool of registered sources and a queue of pending triggers, decide
//! which source (if any) earns credit for which trigger and emit
//! event-level and/or privacy-budgeted aggregate reports.
//!
//! Core invariants:
//! - Deterministic source selection (stable multi-key priority race)
//! - At most one winner per trigger; runner-ups flip to IGNORED
//! - Monotonic, final PENDING → {ATTRIBUTED | IGNORED} transitions
//! - Per-source aggregate budget enforced with checked arithmetic
//! - Cross-network rate limits over an append-only attribution ledger
//! - Malformed wire JSON fails closed, never fails the batch
//!
//! All persistence goes through the [`store::TransactionalStore`]
//! boundary; each trigger resolves inside one atomic transaction.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod aggregate;
pub mod debug_report;
pub mod engine;
pub mod error;
pub mod filter;
pub mod params;
pub mod report;
pub mod site;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod testing;
pub mod trigger;
pub mod xna;

pub use crate::engine::AttributionEngine;
pub use crate::error::{MatchbookError, MatchbookResult};
pub use crate::params::EngineConfig;
pub use crate::store::{MemoryStore, StoreTransaction, TransactionalStore};
