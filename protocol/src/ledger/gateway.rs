//! Retrying, classifying front for a [`LedgerClient`].

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{LedgerClient, LedgerCredit, LedgerError, LedgerOp, Receipt};
use crate::config::RetryPolicy;
use crate::credit::Vote;
use crate::error::{EngineError, EngineResult};
use crate::identity::UserId;

/// The engine's only path to the ledger.
///
/// Every call returns either a successful receipt or one of
/// `EngineError::LedgerRejected` / `EngineError::LedgerUnavailable`.
#[derive(Clone)]
pub struct LedgerGateway {
    client: Arc<dyn LedgerClient>,
    retry: RetryPolicy,
}

impl LedgerGateway {
    pub fn new(client: Arc<dyn LedgerClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // -- State-changing operations -------------------------------------------

    /// Returns the ledger-assigned credit id with the receipt.
    pub async fn generate_credit(
        &self,
        caller: UserId,
        amount_kg: u64,
        price_gwei: u64,
    ) -> EngineResult<(u64, Receipt)> {
        let receipt = self
            .submit(LedgerOp::GenerateCredit, || {
                self.client.generate_credit(caller, amount_kg, price_gwei)
            })
            .await?;
        match receipt.credit_id {
            Some(id) => Ok((id, receipt)),
            None => Err(EngineError::LedgerRejected {
                operation: LedgerOp::GenerateCredit.to_string(),
                reason: "receipt carries no credit id".into(),
            }),
        }
    }

    pub async fn sell_credit(
        &self,
        caller: UserId,
        ledger_id: u64,
        price_gwei: u64,
    ) -> EngineResult<Receipt> {
        self.submit(LedgerOp::SellCredit, || {
            self.client.sell_credit(caller, ledger_id, price_gwei)
        })
        .await
    }

    pub async fn buy_credit(
        &self,
        caller: UserId,
        ledger_id: u64,
        value_gwei: u64,
    ) -> EngineResult<Receipt> {
        self.submit(LedgerOp::BuyCredit, || {
            self.client.buy_credit(caller, ledger_id, value_gwei)
        })
        .await
    }

    pub async fn remove_from_sale(&self, caller: UserId, ledger_id: u64) -> EngineResult<Receipt> {
        self.submit(LedgerOp::RemoveFromSale, || {
            self.client.remove_from_sale(caller, ledger_id)
        })
        .await
    }

    pub async fn expire(&self, caller: UserId, ledger_id: u64) -> EngineResult<Receipt> {
        self.submit(LedgerOp::Expire, || self.client.expire(caller, ledger_id))
            .await
    }

    pub async fn request_audit(
        &self,
        caller: UserId,
        ledger_id: u64,
        fee_gwei: u64,
        auditors: &[UserId],
    ) -> EngineResult<Receipt> {
        self.submit(LedgerOp::RequestAudit, || {
            self.client
                .request_audit(caller, ledger_id, fee_gwei, auditors.to_vec())
        })
        .await
    }

    pub async fn audit_credit(
        &self,
        caller: UserId,
        ledger_id: u64,
        vote: Vote,
    ) -> EngineResult<Receipt> {
        self.submit(LedgerOp::AuditCredit, || {
            self.client.audit_credit(caller, ledger_id, vote)
        })
        .await
    }

    // -- Views ---------------------------------------------------------------

    pub async fn credit(&self, ledger_id: u64) -> EngineResult<Option<LedgerCredit>> {
        self.call(LedgerOp::Credits, || self.client.credit(ledger_id))
            .await
    }

    pub async fn price(&self, ledger_id: u64) -> EngineResult<u64> {
        self.call(LedgerOp::GetPrice, || self.client.price(ledger_id))
            .await
    }

    pub async fn auditor_list(&self, ledger_id: u64) -> EngineResult<Vec<UserId>> {
        self.call(LedgerOp::GetAuditorList, || self.client.auditor_list(ledger_id))
            .await
    }

    // -- Plumbing ------------------------------------------------------------

    /// [`call`](Self::call) plus receipt status classification.
    async fn submit<F, Fut>(&self, op: LedgerOp, operation: F) -> EngineResult<Receipt>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Receipt, LedgerError>>,
    {
        let receipt = self.call(op, operation).await?;
        if !receipt.is_success() {
            return Err(EngineError::LedgerRejected {
                operation: op.to_string(),
                reason: receipt
                    .reason
                    .unwrap_or_else(|| format!("receipt status {}", receipt.status)),
            });
        }
        debug!(operation = %op, tx_hash = %receipt.tx_hash, "ledger call confirmed");
        Ok(receipt)
    }

    /// Runs `operation`, retrying only while the ledger is unavailable and
    /// the attempt budget lasts.
    async fn call<T, F, Fut>(&self, op: LedgerOp, operation: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(LedgerError::Rejected { reason, .. }) => {
                    return Err(EngineError::LedgerRejected {
                        operation: op.to_string(),
                        reason,
                    });
                }
                Err(LedgerError::Unavailable { reason, .. }) => {
                    if attempts >= max_attempts {
                        warn!(
                            operation = %op,
                            attempts,
                            reason = %reason,
                            "ledger unavailable, retries exhausted"
                        );
                        return Err(EngineError::LedgerUnavailable {
                            operation: op.to_string(),
                            attempts,
                            reason,
                        });
                    }

                    let delay = self.retry.delay_for_attempt(attempts - 1);
                    warn!(
                        operation = %op,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "ledger unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for LedgerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerGateway")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ledger::{Fault, InMemoryLedger};

    const NGO: UserId = UserId(1);
    const BUYER: UserId = UserId(2);

    fn gateway(max_attempts: u32) -> (Arc<InMemoryLedger>, LedgerGateway) {
        let ledger = Arc::new(InMemoryLedger::new());
        let gw = LedgerGateway::new(ledger.clone(), RetryPolicy::immediate(max_attempts));
        (ledger, gw)
    }

    #[tokio::test]
    async fn generate_returns_ledger_id() {
        let (_, gw) = gateway(1);
        let (id, receipt) = gw.generate_credit(NGO, 100, 5).await.unwrap();
        assert_eq!(id, 1);
        assert!(receipt.is_success());
        assert!(receipt.tx_hash.starts_with("0x"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (ledger, gw) = gateway(4);
        ledger.fail_next(LedgerOp::GenerateCredit, Fault::Unavailable, 3);
        gw.generate_credit(NGO, 100, 5).await.unwrap();
        assert_eq!(ledger.call_count(LedgerOp::GenerateCredit), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let (ledger, gw) = gateway(3);
        ledger.fail_next(LedgerOp::GenerateCredit, Fault::Unavailable, 10);
        let err = gw.generate_credit(NGO, 100, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerUnavailable);
        assert!(matches!(err, EngineError::LedgerUnavailable { attempts: 3, .. }));
        assert_eq!(ledger.call_count(LedgerOp::GenerateCredit), 3);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let (ledger, gw) = gateway(5);
        let (id, _) = gw.generate_credit(NGO, 100, 5).await.unwrap();

        // Only the owner may list.
        let err = gw.sell_credit(BUYER, id, 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerRejected);
        assert_eq!(ledger.call_count(LedgerOp::SellCredit), 1);

        ledger.fail_next(LedgerOp::SellCredit, Fault::Rejected, 1);
        let err = gw.sell_credit(NGO, id, 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerRejected);
        assert_eq!(ledger.call_count(LedgerOp::SellCredit), 2);
    }

    #[tokio::test]
    async fn views_are_retried_too() {
        let (ledger, gw) = gateway(2);
        let (id, _) = gw.generate_credit(NGO, 100, 5).await.unwrap();
        ledger.fail_next(LedgerOp::Credits, Fault::Unavailable, 1);
        let view = gw.credit(id).await.unwrap().expect("credit on ledger");
        assert_eq!(view.owner, NGO);
        assert_eq!(gw.price(id).await.unwrap(), 5);
        assert!(gw.auditor_list(id).await.unwrap().is_empty());
    }
}
