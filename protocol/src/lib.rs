// Copyright (c) 2026 H2Credit Developers. MIT License.
// See LICENSE for details.

//! # H2Credit Protocol: Credit Lifecycle Engine
//!
//! Hydrogen credits are minted by NGOs for verified green hydrogen
//! production, audited by a quorum of independent auditors, traded between
//! buyers and finally retired. The ledger contract is the public record of
//! all of it; this crate keeps the business-level state, enforces the
//! lifecycle rules and keeps the two in step.
//!
//! ## Architecture
//!
//! - **credit**: the credit record and its state machine.
//! - **engine**: every write path (creation, audit tally, trading, expiry,
//!   verification decisions, reconciliation), serialized per credit.
//! - **ledger**: the ledger client trait, the retrying gateway and an
//!   in-memory ledger.
//! - **storage**: sled persistence and the credit store.
//! - **projector**: buyer, NGO and auditor read models.
//! - **certificate**: write-once retirement certificates.
//! - **verification**: oracle-screened production claims.
//! - **identity**: accounts, roles and sessions.
//! - **config**: constants and the runtime `EngineConfig`.
//!
//! ## Ground Rules
//!
//! 1. The ledger is authoritative. A local transition that the ledger
//!    refuses is undone; one whose fate is unknown is flagged and repaired
//!    from the ledger on the next read.
//! 2. A credit is decided only when every assigned auditor has voted.
//! 3. Read models are recomputed on every call and never written.

pub mod certificate;
pub mod config;
pub mod credit;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod locks;
pub mod projector;
pub mod storage;
pub mod transaction;
pub mod verification;

pub use credit::{Credit, CreditDraft, CreditId, RequestStatus, Verdict, Vote, VoteOutcome};
pub use engine::CreditEngine;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use identity::{Role, Session, UserId};
