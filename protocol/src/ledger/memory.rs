//! In-process ledger.
//!
//! Enforces the same caller and state rules as the credit contract so that
//! engine bugs surface as ledger rejections in tests, and supports fault
//! injection for exercising retries and rollbacks. The node uses it in
//! devnet mode.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LedgerClient, LedgerCredit, LedgerError, LedgerOp, Receipt};
use crate::config::LEDGER_SUCCESS_STATUS;
use crate::credit::Vote;
use crate::identity::UserId;

/// An injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The call times out without a verdict.
    Unavailable,
    /// The call produces a failed receipt.
    Rejected,
}

#[derive(Debug, Default)]
struct LedgerState {
    last_id: u64,
    nonce: u64,
    credits: HashMap<u64, LedgerCredit>,
    faults: HashMap<LedgerOp, VecDeque<Fault>>,
    calls: HashMap<LedgerOp, u32>,
}

type Outcome = Result<Option<u64>, String>;

impl LedgerState {
    fn enter(&mut self, op: LedgerOp) -> Option<Fault> {
        *self.calls.entry(op).or_default() += 1;
        self.faults.get_mut(&op).and_then(|queue| queue.pop_front())
    }

    fn receipt(&mut self, op: LedgerOp, outcome: Outcome) -> Receipt {
        self.nonce += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(op.to_string().as_bytes());
        hasher.update(&self.nonce.to_be_bytes());
        let tx_hash = format!("0x{}", hex::encode(hasher.finalize().as_bytes()));
        match outcome {
            Ok(credit_id) => Receipt {
                status: LEDGER_SUCCESS_STATUS,
                tx_hash,
                credit_id,
                reason: None,
            },
            Err(reason) => Receipt {
                status: 0,
                tx_hash,
                credit_id: None,
                reason: Some(reason),
            },
        }
    }

    fn credit_mut(&mut self, id: u64) -> Result<&mut LedgerCredit, String> {
        self.credits
            .get_mut(&id)
            .ok_or_else(|| format!("credit {id} does not exist"))
    }
}

/// Thread-safe in-memory implementation of [`LedgerClient`].
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` calls of `op` fail with `fault`.
    pub fn fail_next(&self, op: LedgerOp, fault: Fault, times: usize) {
        let mut state = self.state.lock();
        state
            .faults
            .entry(op)
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
    }

    /// Drops any pending injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// How many times `op` was invoked, failed attempts included.
    pub fn call_count(&self, op: LedgerOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn snapshot(&self, id: u64) -> Option<LedgerCredit> {
        self.state.lock().credits.get(&id).cloned()
    }

    /// Edits the ledger's record directly, bypassing contract rules.
    /// Used to simulate out-of-band ledger activity.
    pub fn patch_credit(&self, id: u64, patch: impl FnOnce(&mut LedgerCredit)) -> bool {
        match self.state.lock().credits.get_mut(&id) {
            Some(credit) => {
                patch(credit);
                true
            }
            None => false,
        }
    }

    fn transact(
        &self,
        op: LedgerOp,
        apply: impl FnOnce(&mut LedgerState) -> Outcome,
    ) -> Result<Receipt, LedgerError> {
        let mut state = self.state.lock();
        match state.enter(op) {
            Some(Fault::Unavailable) => Err(LedgerError::Unavailable {
                operation: op,
                reason: "injected outage".into(),
            }),
            Some(Fault::Rejected) => Ok(state.receipt(op, Err("injected rejection".into()))),
            None => {
                let outcome = apply(&mut state);
                Ok(state.receipt(op, outcome))
            }
        }
    }

    fn view<T>(
        &self,
        op: LedgerOp,
        read: impl FnOnce(&LedgerState) -> Result<T, String>,
    ) -> Result<T, LedgerError> {
        let mut state = self.state.lock();
        match state.enter(op) {
            Some(Fault::Unavailable) => Err(LedgerError::Unavailable {
                operation: op,
                reason: "injected outage".into(),
            }),
            Some(Fault::Rejected) => Err(LedgerError::Rejected {
                operation: op,
                reason: "injected rejection".into(),
            }),
            None => read(&state).map_err(|reason| LedgerError::Rejected {
                operation: op,
                reason,
            }),
        }
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn generate_credit(
        &self,
        caller: UserId,
        amount_kg: u64,
        price_gwei: u64,
    ) -> Result<Receipt, LedgerError> {
        self.transact(LedgerOp::GenerateCredit, |state| {
            if amount_kg == 0 || price_gwei == 0 {
                return Err("amount and price must be positive".into());
            }
            state.last_id += 1;
            let id = state.last_id;
            state.credits.insert(
                id,
                LedgerCredit {
                    id,
                    creator: caller,
                    owner: caller,
                    amount_kg,
                    price_gwei,
                    for_sale: false,
                    expired: false,
                    audit_fee_gwei: 0,
                    auditors: Vec::new(),
                    votes: Vec::new(),
                },
            );
            Ok(Some(id))
        })
    }

    async fn sell_credit(
        &self,
        caller: UserId,
        credit_id: u64,
        price_gwei: u64,
    ) -> Result<Receipt, LedgerError> {
        self.transact(LedgerOp::SellCredit, |state| {
            let credit = state.credit_mut(credit_id)?;
            if credit.owner != caller {
                return Err("only the owner can sell".into());
            }
            if credit.expired {
                return Err("credit is expired".into());
            }
            if price_gwei == 0 {
                return Err("price must be positive".into());
            }
            credit.price_gwei = price_gwei;
            credit.for_sale = true;
            Ok(None)
        })
    }

    async fn buy_credit(
        &self,
        caller: UserId,
        credit_id: u64,
        value_gwei: u64,
    ) -> Result<Receipt, LedgerError> {
        self.transact(LedgerOp::BuyCredit, |state| {
            let credit = state.credit_mut(credit_id)?;
            if !credit.for_sale || credit.expired {
                return Err("credit is not for sale".into());
            }
            if credit.owner == caller {
                return Err("owner cannot buy own credit".into());
            }
            if value_gwei < credit.price_gwei {
                return Err("insufficient value".into());
            }
            credit.owner = caller;
            credit.for_sale = false;
            Ok(None)
        })
    }

    async fn remove_from_sale(&self, caller: UserId, credit_id: u64) -> Result<Receipt, LedgerError> {
        self.transact(LedgerOp::RemoveFromSale, |state| {
            let credit = state.credit_mut(credit_id)?;
            if credit.owner != caller {
                return Err("only the owner can remove from sale".into());
            }
            if !credit.for_sale {
                return Err("credit is not for sale".into());
            }
            credit.for_sale = false;
            Ok(None)
        })
    }

    async fn expire(&self, caller: UserId, credit_id: u64) -> Result<Receipt, LedgerError> {
        self.transact(LedgerOp::Expire, |state| {
            let credit = state.credit_mut(credit_id)?;
            if credit.creator != caller {
                return Err("only the creator can expire".into());
            }
            if credit.expired {
                return Err("credit already expired".into());
            }
            credit.expired = true;
            credit.for_sale = false;
            Ok(None)
        })
    }

    async fn request_audit(
        &self,
        caller: UserId,
        credit_id: u64,
        fee_gwei: u64,
        auditors: Vec<UserId>,
    ) -> Result<Receipt, LedgerError> {
        self.transact(LedgerOp::RequestAudit, |state| {
            let credit = state.credit_mut(credit_id)?;
            if credit.owner != caller {
                return Err("only the owner can request an audit".into());
            }
            if !credit.auditors.is_empty() {
                return Err("audit already requested".into());
            }
            if auditors.is_empty() {
                return Err("no auditors supplied".into());
            }
            credit.audit_fee_gwei = fee_gwei;
            credit.auditors = auditors;
            Ok(None)
        })
    }

    async fn audit_credit(
        &self,
        caller: UserId,
        credit_id: u64,
        vote: Vote,
    ) -> Result<Receipt, LedgerError> {
        self.transact(LedgerOp::AuditCredit, |state| {
            let credit = state.credit_mut(credit_id)?;
            if !credit.auditors.contains(&caller) {
                return Err("caller is not an assigned auditor".into());
            }
            if credit.votes.iter().any(|(auditor, _)| *auditor == caller) {
                return Err("already audited".into());
            }
            credit.votes.push((caller, vote));
            Ok(None)
        })
    }

    async fn credit(&self, credit_id: u64) -> Result<Option<LedgerCredit>, LedgerError> {
        self.view(LedgerOp::Credits, |state| {
            Ok(state.credits.get(&credit_id).cloned())
        })
    }

    async fn price(&self, credit_id: u64) -> Result<u64, LedgerError> {
        self.view(LedgerOp::GetPrice, |state| {
            state
                .credits
                .get(&credit_id)
                .map(|c| c.price_gwei)
                .ok_or_else(|| format!("credit {credit_id} does not exist"))
        })
    }

    async fn auditor_list(&self, credit_id: u64) -> Result<Vec<UserId>, LedgerError> {
        self.view(LedgerOp::GetAuditorList, |state| {
            state
                .credits
                .get(&credit_id)
                .map(|c| c.auditors.clone())
                .ok_or_else(|| format!("credit {credit_id} does not exist"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NGO: UserId = UserId(1);
    const BUYER: UserId = UserId(2);
    const AUDITOR: UserId = UserId(3);

    async fn generated(ledger: &InMemoryLedger) -> u64 {
        let receipt = ledger.generate_credit(NGO, 100, 10).await.unwrap();
        receipt.credit_id.expect("credit id")
    }

    #[tokio::test]
    async fn full_contract_flow() {
        let ledger = InMemoryLedger::new();
        let id = generated(&ledger).await;

        assert!(ledger
            .request_audit(NGO, id, 5, vec![AUDITOR])
            .await
            .unwrap()
            .is_success());
        assert!(ledger
            .audit_credit(AUDITOR, id, Vote::Accept)
            .await
            .unwrap()
            .is_success());
        assert!(ledger.sell_credit(NGO, id, 20).await.unwrap().is_success());
        assert!(ledger.buy_credit(BUYER, id, 20).await.unwrap().is_success());

        let view = ledger.snapshot(id).unwrap();
        assert_eq!(view.owner, BUYER);
        assert_eq!(view.creator, NGO);
        assert!(!view.for_sale);
        assert_eq!(view.audit_score(), 1);
        assert_eq!(view.audit_fee_gwei, 5);
    }

    #[tokio::test]
    async fn contract_rules_produce_failed_receipts() {
        let ledger = InMemoryLedger::new();
        let id = generated(&ledger).await;
        ledger.request_audit(NGO, id, 0, vec![AUDITOR]).await.unwrap();

        let stranger = ledger.audit_credit(BUYER, id, Vote::Accept).await.unwrap();
        assert!(!stranger.is_success());

        ledger.audit_credit(AUDITOR, id, Vote::Accept).await.unwrap();
        let twice = ledger.audit_credit(AUDITOR, id, Vote::Reject).await.unwrap();
        assert_eq!(twice.reason.as_deref(), Some("already audited"));

        ledger.sell_credit(NGO, id, 50).await.unwrap();
        let cheap = ledger.buy_credit(BUYER, id, 49).await.unwrap();
        assert_eq!(cheap.reason.as_deref(), Some("insufficient value"));

        let not_creator = ledger.expire(BUYER, id).await.unwrap();
        assert!(!not_creator.is_success());
    }

    #[tokio::test]
    async fn faults_are_consumed_in_order() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next(LedgerOp::GenerateCredit, Fault::Unavailable, 1);
        ledger.fail_next(LedgerOp::GenerateCredit, Fault::Rejected, 1);

        assert!(matches!(
            ledger.generate_credit(NGO, 1, 1).await,
            Err(LedgerError::Unavailable { .. })
        ));
        assert!(!ledger.generate_credit(NGO, 1, 1).await.unwrap().is_success());
        assert!(ledger.generate_credit(NGO, 1, 1).await.unwrap().is_success());
        assert_eq!(ledger.call_count(LedgerOp::GenerateCredit), 3);
    }

    #[tokio::test]
    async fn tx_hashes_are_unique() {
        let ledger = InMemoryLedger::new();
        let a = ledger.generate_credit(NGO, 1, 1).await.unwrap();
        let b = ledger.generate_credit(NGO, 1, 1).await.unwrap();
        assert_ne!(a.tx_hash, b.tx_hash);
        assert_eq!(a.tx_hash.len(), 2 + 64);
    }
}
