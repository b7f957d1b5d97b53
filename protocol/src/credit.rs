//! # Hydrogen Credits
//!
//! A [`Credit`] is one tradable claim of verified hydrogen production. This
//! module owns the credit's state machine; the engine decides *when* a
//! transition runs (under the credit's lock, mirrored to the ledger), but
//! *whether* it is legal is decided here.
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐  last vote, score > 0   ┌──────────────────┐  put_for_sale  ┌─────────┐
//!   │ Pending │ ──────────────────────► │ Decided-Accepted │ ─────────────► │ ForSale │
//!   └────┬────┘                          └────────┬─────────┘ ◄───────────── └────┬────┘
//!        │ last vote, score <= 0                  │          remove / purchase     │
//!        ▼                                        │ expire                         │ expire
//!   ┌──────────────────┐                          ▼                                ▼
//!   │ Decided-Rejected │                    ┌─────────┐ ◄──────────────────────────┘
//!   └──────────────────┘                    │ Expired │  (terminal)
//!                                           └─────────┘
//! ```
//!
//! The quorum rule is all-or-nothing: a credit is decided only once every
//! assigned auditor has voted, however lopsided the running score is.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::identity::UserId;

// ---------------------------------------------------------------------------
// Identifiers & enums
// ---------------------------------------------------------------------------

/// Off-chain identifier of a credit, assigned by the credit store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreditId(pub u64);

impl CreditId {
    /// Big-endian key so sled iterates credits in id order.
    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for CreditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single auditor's ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Accept,
    Reject,
}

impl Vote {
    pub fn from_accept(accept: bool) -> Self {
        if accept {
            Vote::Accept
        } else {
            Vote::Reject
        }
    }

    /// Contribution to the audit score.
    pub fn weight(self) -> i64 {
        match self {
            Vote::Accept => 1,
            Vote::Reject => -1,
        }
    }
}

/// Outcome of a completed audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Audit/listing status of a credit. Expiry is tracked separately by
/// [`Credit::is_expired`] because it can happen from two of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting for the assigned auditors to vote.
    Pending,
    /// Every assigned auditor has voted.
    Decided(Verdict),
    /// Accepted and currently listed on the marketplace.
    ForSale,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "Pending"),
            RequestStatus::Decided(Verdict::Accepted) => write!(f, "Decided-Accepted"),
            RequestStatus::Decided(Verdict::Rejected) => write!(f, "Decided-Rejected"),
            RequestStatus::ForSale => write!(f, "ForSale"),
        }
    }
}

// ---------------------------------------------------------------------------
// CreditDraft
// ---------------------------------------------------------------------------

/// Caller-supplied fields of a new credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDraft {
    pub name: String,
    pub amount_kg: u64,
    /// Listing price in gwei.
    pub price_gwei: u64,
    /// Off-chain proof reference (IPFS, object storage, ...).
    pub document_url: String,
}

impl CreditDraft {
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("credit name must not be empty".into()));
        }
        if self.amount_kg == 0 {
            return Err(EngineError::Validation("amount_kg must be positive".into()));
        }
        if self.price_gwei == 0 {
            return Err(EngineError::Validation("price must be positive".into()));
        }
        Ok(())
    }
}

/// What a successful vote did to the credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub credit_id: CreditId,
    pub audit_score: i64,
    pub votes_remaining: usize,
    /// Set only by the vote that completed the quorum.
    pub decision: Option<Verdict>,
}

// ---------------------------------------------------------------------------
// Credit
// ---------------------------------------------------------------------------

/// Business-level record of a hydrogen credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub id: CreditId,
    /// Identifier the ledger assigned when the credit was generated on-chain.
    pub ledger_id: u64,
    pub name: String,
    pub amount_kg: u64,
    /// Last agreed price in gwei: the listing price until the first trade,
    /// then the most recent trade price.
    pub price_gwei: u64,
    pub document_url: String,
    pub creator_id: UserId,
    pub owner_id: UserId,
    pub request_status: RequestStatus,
    pub audit_score: i64,
    pub auditors_assigned: BTreeSet<UserId>,
    /// Ballots cast so far; the keys are the auditors who voted.
    pub auditor_votes: BTreeMap<UserId, Vote>,
    pub is_active: bool,
    pub is_expired: bool,
    pub sale_price_gwei: Option<u64>,
    /// Local state may diverge from the ledger; repair on next read.
    pub reconciliation_needed: bool,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Credit {
    pub(crate) fn new(
        id: CreditId,
        ledger_id: u64,
        creator_id: UserId,
        draft: CreditDraft,
        auditors_assigned: BTreeSet<UserId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            ledger_id,
            name: draft.name,
            amount_kg: draft.amount_kg,
            price_gwei: draft.price_gwei,
            document_url: draft.document_url,
            creator_id,
            owner_id: creator_id,
            request_status: RequestStatus::Pending,
            audit_score: 0,
            auditors_assigned,
            auditor_votes: BTreeMap::new(),
            is_active: false,
            is_expired: false,
            sale_price_gwei: None,
            reconciliation_needed: false,
            created_at: now,
            decided_at: None,
            expired_at: None,
        }
    }

    // -- Queries -------------------------------------------------------------

    /// The audit verdict, once decided. A listed credit is an accepted one.
    pub fn verdict(&self) -> Option<Verdict> {
        match self.request_status {
            RequestStatus::Pending => None,
            RequestStatus::Decided(v) => Some(v),
            RequestStatus::ForSale => Some(Verdict::Accepted),
        }
    }

    pub fn auditors_voted(&self) -> impl Iterator<Item = UserId> + '_ {
        self.auditor_votes.keys().copied()
    }

    pub fn votes_remaining(&self) -> usize {
        self.auditors_assigned.len() - self.auditor_votes.len()
    }

    /// Every assigned auditor has voted.
    pub fn is_quorum_reached(&self) -> bool {
        !self.auditors_assigned.is_empty() && self.votes_remaining() == 0
    }

    /// Score derived from the recorded ballots alone.
    pub fn recomputed_score(&self) -> i64 {
        self.auditor_votes.values().map(|v| v.weight()).sum()
    }

    /// Human-readable lifecycle state, with expiry taking precedence.
    pub fn state_label(&self) -> String {
        if self.is_expired {
            "Expired".into()
        } else {
            self.request_status.to_string()
        }
    }

    /// Structural invariants every persisted credit must satisfy.
    pub fn invariants_hold(&self) -> bool {
        let voted_subset = self
            .auditor_votes
            .keys()
            .all(|a| self.auditors_assigned.contains(a));
        let score_consistent = self.audit_score == self.recomputed_score();
        let expiry_consistent = !(self.is_expired && self.is_active);
        let listing_consistent = self.is_active == self.sale_price_gwei.is_some()
            && self.is_active == (self.request_status == RequestStatus::ForSale);
        let decision_consistent = self.is_quorum_reached() != (self.verdict().is_none());
        voted_subset && score_consistent && expiry_consistent && listing_consistent && decision_consistent
    }

    fn invalid_state(&self, expected: &str) -> EngineError {
        EngineError::InvalidState {
            subject: format!("credit {}", self.id),
            current: self.state_label(),
            expected: expected.into(),
        }
    }

    fn is_accepted_and_held(&self) -> bool {
        !self.is_expired
            && self.request_status == RequestStatus::Decided(Verdict::Accepted)
            && self.audit_score > 0
    }

    // -- Transitions ---------------------------------------------------------

    /// Records `auditor`'s ballot and decides the credit when the quorum
    /// completes.
    ///
    /// Precondition order is significant: a replayed final vote that loses
    /// the race against the deciding one sees `InvalidState`, not
    /// `DuplicateVote`.
    pub(crate) fn record_vote(
        &mut self,
        auditor: UserId,
        vote: Vote,
        now: DateTime<Utc>,
    ) -> EngineResult<VoteOutcome> {
        if !self.auditors_assigned.contains(&auditor) {
            return Err(EngineError::unauthorized(
                auditor,
                format!("vote on credit {}", self.id),
            ));
        }
        if self.is_expired || self.request_status != RequestStatus::Pending {
            return Err(self.invalid_state("Pending"));
        }
        if self.auditor_votes.contains_key(&auditor) {
            return Err(EngineError::DuplicateVote {
                credit_id: self.id,
                auditor,
            });
        }

        self.auditor_votes.insert(auditor, vote);
        self.audit_score += vote.weight();

        let decision = if self.is_quorum_reached() {
            let verdict = if self.audit_score > 0 {
                Verdict::Accepted
            } else {
                Verdict::Rejected
            };
            self.request_status = RequestStatus::Decided(verdict);
            self.decided_at = Some(now);
            Some(verdict)
        } else {
            None
        };

        Ok(VoteOutcome {
            credit_id: self.id,
            audit_score: self.audit_score,
            votes_remaining: self.votes_remaining(),
            decision,
        })
    }

    /// Lists an accepted credit on the marketplace.
    pub(crate) fn list_for_sale(&mut self, caller: UserId, price_gwei: u64) -> EngineResult<()> {
        if caller != self.owner_id {
            return Err(EngineError::unauthorized(
                caller,
                format!("sell credit {}", self.id),
            ));
        }
        if !self.is_accepted_and_held() {
            return Err(self.invalid_state("Decided-Accepted with a positive score"));
        }
        if price_gwei == 0 {
            return Err(EngineError::Validation("sale price must be positive".into()));
        }
        self.request_status = RequestStatus::ForSale;
        self.is_active = true;
        self.sale_price_gwei = Some(price_gwei);
        Ok(())
    }

    /// Withdraws a listing, returning the credit to `Decided-Accepted`.
    pub(crate) fn delist(&mut self, caller: UserId) -> EngineResult<()> {
        if caller != self.owner_id {
            return Err(EngineError::unauthorized(
                caller,
                format!("remove credit {} from sale", self.id),
            ));
        }
        if self.is_expired || self.request_status != RequestStatus::ForSale {
            return Err(self.invalid_state("ForSale"));
        }
        self.clear_listing();
        Ok(())
    }

    /// Hands a listed credit to `buyer`. Returns the price paid in gwei.
    pub(crate) fn transfer_to(&mut self, buyer: UserId) -> EngineResult<u64> {
        if self.is_expired || self.request_status != RequestStatus::ForSale {
            return Err(self.invalid_state("ForSale"));
        }
        if buyer == self.owner_id {
            return Err(EngineError::unauthorized(
                buyer,
                format!("buy credit {} they already own", self.id),
            ));
        }
        let paid = self
            .sale_price_gwei
            .ok_or_else(|| self.invalid_state("ForSale with a sale price"))?;
        self.owner_id = buyer;
        self.price_gwei = paid;
        self.clear_listing();
        Ok(paid)
    }

    /// Checks every expiry precondition except the secret, which only the
    /// account directory can verify.
    pub(crate) fn check_expirable(&self, caller: UserId, confirmation_name: &str) -> EngineResult<()> {
        if caller != self.creator_id {
            return Err(EngineError::unauthorized(
                caller,
                format!("expire credit {}", self.id),
            ));
        }
        if self.is_expired || self.verdict() != Some(Verdict::Accepted) {
            return Err(self.invalid_state("Decided-Accepted or ForSale"));
        }
        if confirmation_name != self.name {
            return Err(EngineError::ConfirmationMismatch { credit_id: self.id });
        }
        Ok(())
    }

    /// Retires the credit. Callers must have passed [`check_expirable`](Self::check_expirable).
    pub(crate) fn mark_expired(&mut self, now: DateTime<Utc>) {
        if self.request_status == RequestStatus::ForSale {
            self.clear_listing();
        }
        self.is_expired = true;
        self.is_active = false;
        self.expired_at = Some(now);
    }

    fn clear_listing(&mut self) {
        self.request_status = RequestStatus::Decided(Verdict::Accepted);
        self.is_active = false;
        self.sale_price_gwei = None;
    }
}
