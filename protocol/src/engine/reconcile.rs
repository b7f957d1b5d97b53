//! Repairing local credit state from the ledger's record.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::CreditEngine;
use crate::credit::{Credit, CreditId, RequestStatus, Verdict};
use crate::error::{EngineError, EngineResult};
use crate::ledger::LedgerCredit;

impl CreditEngine {
    /// Reads a credit, reconciling it first if it is flagged. If the ledger
    /// cannot be reached the stored record is returned as is, still flagged.
    pub async fn credit(&self, id: CreditId) -> EngineResult<Credit> {
        let credit = self.store.get_credit(id)?;
        if !credit.reconciliation_needed {
            return Ok(credit);
        }

        let _guard = self.locks.acquire(id).await;
        // A transition in flight holds the flag; it may have settled while
        // we waited for the lock.
        let current = self.store.get_credit(id)?;
        if !current.reconciliation_needed {
            return Ok(current);
        }
        match self.reconcile_locked(id).await {
            Ok(repaired) => Ok(repaired),
            Err(e) => {
                warn!(credit_id = %id, error = %e, "reconciliation deferred");
                self.store.get_credit(id)
            }
        }
    }

    /// Overwrites the ledger-owned fields of a credit (owner, listing,
    /// expiry, ballots) with the ledger's view and clears the flag.
    pub async fn reconcile(&self, id: CreditId) -> EngineResult<Credit> {
        let _guard = self.locks.acquire(id).await;
        self.reconcile_locked(id).await
    }

    /// Loads a credit for a transition. The caller holds the credit's lock.
    pub(super) async fn load_for_transition(&self, id: CreditId) -> EngineResult<Credit> {
        let credit = self.store.get_credit(id)?;
        if credit.reconciliation_needed {
            self.reconcile_locked(id).await
        } else {
            Ok(credit)
        }
    }

    async fn reconcile_locked(&self, id: CreditId) -> EngineResult<Credit> {
        let mut credit = self.store.get_credit(id)?;
        let view = self
            .ledger
            .credit(credit.ledger_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "ledger credit",
                id: credit.ledger_id.to_string(),
            })?;

        let changed = apply_ledger_view(&mut credit, &view, Utc::now());
        credit.reconciliation_needed = false;
        self.store.save(&credit)?;
        info!(
            credit_id = %id,
            changed,
            state = %credit.state_label(),
            "credit reconciled with ledger"
        );
        Ok(credit)
    }
}

/// Rewrites `credit` to agree with `view`. Returns whether anything changed.
fn apply_ledger_view(credit: &mut Credit, view: &LedgerCredit, now: DateTime<Utc>) -> bool {
    let before = credit.clone();

    let votes = view
        .votes
        .iter()
        .filter(|(auditor, _)| credit.auditors_assigned.contains(auditor))
        .copied()
        .collect();
    credit.auditor_votes = votes;
    credit.audit_score = credit.recomputed_score();

    let verdict = credit.is_quorum_reached().then(|| {
        if credit.audit_score > 0 {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }
    });
    credit.decided_at = match verdict {
        Some(_) => credit.decided_at.or(Some(now)),
        None => None,
    };

    if credit.owner_id != view.owner {
        credit.owner_id = view.owner;
        credit.price_gwei = view.price_gwei;
    }

    let listed = view.for_sale && !view.expired && verdict == Some(Verdict::Accepted);
    credit.request_status = match verdict {
        None => RequestStatus::Pending,
        Some(Verdict::Accepted) if listed => RequestStatus::ForSale,
        Some(v) => RequestStatus::Decided(v),
    };
    credit.is_active = listed;
    credit.sale_price_gwei = listed.then_some(view.price_gwei);

    credit.is_expired = view.expired;
    credit.expired_at = if view.expired {
        credit.expired_at.or(Some(now))
    } else {
        None
    };

    *credit != before
}
