//! Auditor decisions on production verification requests.

use chrono::Utc;
use tracing::warn;

use super::CreditEngine;
use crate::credit::CreditDraft;
use crate::error::EngineResult;
use crate::identity::Session;
use crate::verification::{ProductionClaim, VerificationId, VerificationRequest, VerificationStatus};

impl CreditEngine {
    pub async fn submit_verification(
        &self,
        session: &Session,
        claim: ProductionClaim,
    ) -> EngineResult<VerificationRequest> {
        self.verification.submit(session, claim).await
    }

    /// Approves a pending request and issues the industry's credit, which
    /// then enters the normal quorum audit. A credit already issued for the
    /// request by an approval that failed to record is reused.
    pub async fn approve_verification(
        &self,
        session: &Session,
        id: VerificationId,
    ) -> EngineResult<VerificationRequest> {
        let _decision = self.decisions.lock().await;
        let mut request = self.verification.open_for_decision(session, id)?;

        let amount_kg = request.claim.hydrogen_amount_kg;
        let draft = CreditDraft {
            name: format!("H₂ Credit - {}", request.claim.production_method),
            amount_kg,
            price_gwei: amount_kg.saturating_mul(self.config.verification.price_per_kg_gwei),
            document_url: format!("verification://{}", request.id),
        };
        let credit = match self
            .store
            .find_by_document(request.industry_id, &draft.document_url)?
        {
            Some(existing) => {
                warn!(
                    verification_id = %request.id,
                    credit_id = %existing.id,
                    "credit already issued for this request, recording the decision"
                );
                existing
            }
            None => self.create_credit_for(request.industry_id, draft).await?,
        };

        request.status = VerificationStatus::Approved;
        request.auditor_id = Some(session.user_id);
        request.credit_id = Some(credit.id);
        request.decided_at = Some(Utc::now());
        self.verification.record_decision(&request)?;
        Ok(request)
    }

    pub async fn reject_verification(
        &self,
        session: &Session,
        id: VerificationId,
        notes: Option<String>,
    ) -> EngineResult<VerificationRequest> {
        let _decision = self.decisions.lock().await;
        let mut request = self.verification.open_for_decision(session, id)?;

        request.status = VerificationStatus::Rejected;
        request.auditor_id = Some(session.user_id);
        request.notes = notes;
        request.decided_at = Some(Utc::now());
        self.verification.record_decision(&request)?;
        Ok(request)
    }
}
