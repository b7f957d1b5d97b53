//! Credit creation and the audit tally.

use std::collections::BTreeSet;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::CreditEngine;
use crate::credit::{Credit, CreditDraft, CreditId, Vote, VoteOutcome};
use crate::error::{EngineError, EngineResult};
use crate::identity::{Role, Session, UserId};

/// Answer to "could a claim of this size be audited right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCapacity {
    pub amount_kg: u64,
    pub required: usize,
    pub available: usize,
}

impl CreditEngine {
    /// Auditors a claim of `amount_kg` needs under the configured policy.
    pub fn required_auditors(&self, amount_kg: u64) -> usize {
        self.config.auditor_policy.required_auditors(amount_kg)
    }

    /// Fee paid to the ledger when requesting the audit.
    pub fn audit_fee(&self, amount_kg: u64, price_gwei: u64) -> u64 {
        self.config.audit_fee.fee_for(amount_kg, price_gwei)
    }

    /// Fails with `InsufficientAuditors` if the auditor pool is too small.
    pub fn check_audit_capacity(&self, amount_kg: u64) -> EngineResult<AuditCapacity> {
        let capacity = AuditCapacity {
            amount_kg,
            required: self.required_auditors(amount_kg),
            available: self.accounts.auditors()?.len(),
        };
        if capacity.available < capacity.required {
            return Err(EngineError::InsufficientAuditors {
                required: capacity.required,
                available: capacity.available,
            });
        }
        Ok(capacity)
    }

    /// Issues a new credit on behalf of an NGO and opens its audit.
    pub async fn create_credit(&self, session: &Session, draft: CreditDraft) -> EngineResult<Credit> {
        session.require(Role::Ngo, "create credits")?;
        self.create_credit_for(session.user_id, draft).await
    }

    /// Creation without the role gate; approved verification requests
    /// come through here on the industry's behalf.
    pub(crate) async fn create_credit_for(
        &self,
        creator: UserId,
        draft: CreditDraft,
    ) -> EngineResult<Credit> {
        draft.validate()?;
        let auditors = self.sample_auditors(creator, draft.amount_kg)?;
        let auditor_list: Vec<UserId> = auditors.iter().copied().collect();

        // No local record exists until both ledger calls succeed, so a
        // failure here leaves nothing to roll back.
        let (ledger_id, _) = self
            .ledger
            .generate_credit(creator, draft.amount_kg, draft.price_gwei)
            .await?;
        let fee = self.audit_fee(draft.amount_kg, draft.price_gwei);
        if let Err(e) = self
            .ledger
            .request_audit(creator, ledger_id, fee, &auditor_list)
            .await
        {
            warn!(ledger_id, error = %e, "audit request failed, ledger credit left unaudited");
            return Err(e);
        }

        let credit = self.store.create_credit(creator, draft, ledger_id, auditors)?;
        info!(
            credit_id = %credit.id,
            ledger_id,
            creator = %creator,
            amount_kg = credit.amount_kg,
            auditors = credit.auditors_assigned.len(),
            fee_gwei = fee,
            "credit created, audit pending"
        );
        Ok(credit)
    }

    /// Records an auditor's ballot; the ballot that completes the quorum
    /// decides the credit.
    pub async fn cast_vote(
        &self,
        session: &Session,
        credit_id: CreditId,
        accept: bool,
    ) -> EngineResult<VoteOutcome> {
        session.require(Role::Auditor, "vote on credits")?;
        let vote = Vote::from_accept(accept);

        let _guard = self.locks.acquire(credit_id).await;
        let mut credit = self.load_for_transition(credit_id).await?;
        let before = credit.clone();

        let outcome = credit.record_vote(session.user_id, vote, Utc::now())?;
        let call = self
            .ledger
            .audit_credit(session.user_id, credit.ledger_id, vote);
        self.mirror(&before, &mut credit, call).await?;

        info!(
            credit_id = %credit_id,
            auditor = %session.user_id,
            ?vote,
            score = outcome.audit_score,
            remaining = outcome.votes_remaining,
            "vote recorded"
        );
        if let Some(verdict) = outcome.decision {
            info!(credit_id = %credit_id, ?verdict, score = outcome.audit_score, "quorum reached");
        }
        Ok(outcome)
    }

    fn sample_auditors(&self, creator: UserId, amount_kg: u64) -> EngineResult<BTreeSet<UserId>> {
        let required = self.required_auditors(amount_kg);
        let pool: Vec<UserId> = self
            .accounts
            .auditors()?
            .into_iter()
            .filter(|a| *a != creator)
            .collect();
        if pool.len() < required {
            return Err(EngineError::InsufficientAuditors {
                required,
                available: pool.len(),
            });
        }
        Ok(pool
            .choose_multiple(&mut rand::thread_rng(), required)
            .copied()
            .collect())
    }
}
