//! Expiry behind identity re-confirmation, and retirement certificates.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::CreditEngine;
use crate::certificate::{Certificate, CertificateRegistry};
use crate::credit::{Credit, CreditId};
use crate::error::{EngineError, EngineResult};
use crate::identity::Session;

/// Result of a successful expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expiry {
    pub credit: Credit,
    pub certificate: Certificate,
}

impl CreditEngine {
    /// Re-authenticates the caller ahead of an irreversible action.
    pub fn verify_identity(&self, session: &Session, secret: &str) -> EngineResult<()> {
        self.accounts.verify_secret(session.user_id, secret)
    }

    /// Retires a credit. The creator must re-type the credit's name and
    /// re-supply their secret.
    pub async fn expire(
        &self,
        session: &Session,
        credit_id: CreditId,
        confirmation_name: &str,
        confirmation_secret: &str,
    ) -> EngineResult<Expiry> {
        let _guard = self.locks.acquire(credit_id).await;
        let mut credit = self.load_for_transition(credit_id).await?;
        let before = credit.clone();

        credit.check_expirable(session.user_id, confirmation_name)?;
        self.accounts
            .verify_secret(session.user_id, confirmation_secret)?;

        credit.mark_expired(Utc::now());
        let call = self.ledger.expire(session.user_id, credit.ledger_id);
        self.mirror(&before, &mut credit, call).await?;

        info!(credit_id = %credit_id, creator = %session.user_id, "credit expired");
        let bytes = self.certificates.issue(&credit)?;
        let certificate = CertificateRegistry::decode(&bytes)?;
        Ok(Expiry { credit, certificate })
    }

    /// Canonical certificate bytes of an expired credit, identical on
    /// every call. Readable by the creator, the holder at expiry, and
    /// anyone who once bought the credit.
    pub async fn certificate(&self, session: &Session, credit_id: CreditId) -> EngineResult<Vec<u8>> {
        let credit = self.credit(credit_id).await?;
        let involved = session.user_id == credit.creator_id
            || session.user_id == credit.owner_id
            || self
                .store
                .db()
                .transactions()?
                .iter()
                .any(|t| t.credit_id == credit_id && t.buyer_id == session.user_id);
        if !involved {
            return Err(EngineError::unauthorized(
                session.user_id,
                format!("read the certificate of credit {credit_id}"),
            ));
        }
        if !credit.is_expired {
            return Err(EngineError::InvalidState {
                subject: format!("credit {credit_id}"),
                current: credit.state_label(),
                expected: "Expired".into(),
            });
        }
        self.certificates.issue(&credit)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{Harness, SECRET};
    use crate::certificate::CertificateRegistry;
    use crate::credit::Vote;
    use crate::error::ErrorKind;
    use crate::ledger::{Fault, LedgerOp};

    #[tokio::test]
    async fn expire_issues_a_stable_certificate() {
        let h = Harness::new(3);
        let id = h.listed(40).await;
        h.engine.purchase(&h.buyer, id).await.unwrap();

        let expiry = h.engine.expire(&h.ngo, id, "Green batch", SECRET).await.unwrap();
        assert!(expiry.credit.is_expired);
        assert!(!expiry.credit.is_active);
        assert_eq!(expiry.certificate.holder_id, h.buyer.user_id);
        assert!(expiry.certificate.is_intact());
        assert!(h.ledger.snapshot(expiry.credit.ledger_id).unwrap().expired);

        let by_buyer = h.engine.certificate(&h.buyer, id).await.unwrap();
        let by_creator = h.engine.certificate(&h.ngo, id).await.unwrap();
        assert_eq!(by_buyer, by_creator);
        assert_eq!(CertificateRegistry::decode(&by_buyer).unwrap(), expiry.certificate);
    }

    #[tokio::test]
    async fn name_mismatch_leaves_credit_live() {
        let h = Harness::new(3);
        let credit = h.accepted().await;
        let err = h
            .engine
            .expire(&h.ngo, credit.id, "green batch", SECRET)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfirmationMismatch);
        assert!(!h.engine.store().get_credit(credit.id).unwrap().is_expired);
        assert_eq!(h.ledger.call_count(LedgerOp::Expire), 0);
    }

    #[tokio::test]
    async fn wrong_secret_fails_authentication() {
        let h = Harness::new(3);
        let credit = h.accepted().await;
        let err = h
            .engine
            .expire(&h.ngo, credit.id, "Green batch", "guess")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(h.engine.verify_identity(&h.ngo, SECRET).is_ok());
        assert!(h.engine.verify_identity(&h.ngo, "guess").is_err());
    }

    #[tokio::test]
    async fn only_the_creator_expires_decided_credits() {
        let h = Harness::new(3);
        let pending = h.engine.create_credit(&h.ngo, h.draft(10)).await.unwrap();
        let err = h
            .engine
            .expire(&h.ngo, pending.id, "Green batch", SECRET)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let rejected = h.audited(&[Vote::Reject; 3]).await;
        let err = h
            .engine
            .expire(&h.ngo, rejected.id, "Green batch", SECRET)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let accepted = h.accepted().await;
        let err = h
            .engine
            .expire(&h.buyer, accepted.id, "Green batch", SECRET)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn failed_ledger_expiry_is_rolled_back() {
        let h = Harness::new(3);
        let credit = h.accepted().await;
        h.ledger.fail_next(LedgerOp::Expire, Fault::Rejected, 1);
        let err = h
            .engine
            .expire(&h.ngo, credit.id, "Green batch", SECRET)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerRejected);
        assert!(!h.engine.store().get_credit(credit.id).unwrap().is_expired);
        assert!(h.engine.certificates().get(credit.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn certificates_need_an_expired_credit_and_an_involved_reader() {
        let h = Harness::new(3);
        let credit = h.accepted().await;
        let err = h.engine.certificate(&h.ngo, credit.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        h.engine
            .expire(&h.ngo, credit.id, "Green batch", SECRET)
            .await
            .unwrap();
        let err = h
            .engine
            .certificate(&h.other_buyer, credit.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
