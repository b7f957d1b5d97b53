//! # Marketplace & Portfolio Projector
//!
//! Read-only views derived from the credit store and the trade log. Nothing
//! here is cached: every call recomputes from stored state, so a view can
//! never be staler than the store it reads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::credit::{Credit, CreditId, RequestStatus};
use crate::error::EngineResult;
use crate::identity::UserId;
use crate::storage::CreditStore;
use crate::transaction::Transaction;

/// A credit the buyer holds, with the trade that brought it to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasedCredit {
    pub credit: Credit,
    pub purchase: Transaction,
}

/// Row of the NGO dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSummary {
    pub id: CreditId,
    pub name: String,
    pub amount_kg: u64,
    pub price_gwei: u64,
    pub state: String,
    pub audit_score: i64,
    pub auditors_count: usize,
    pub auditors_left: usize,
    pub owner_id: UserId,
    pub is_expired: bool,
}

impl From<&Credit> for CreditSummary {
    fn from(c: &Credit) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            amount_kg: c.amount_kg,
            price_gwei: c.price_gwei,
            state: c.state_label(),
            audit_score: c.audit_score,
            auditors_count: c.auditors_assigned.len(),
            auditors_left: c.votes_remaining(),
            owner_id: c.owner_id,
            is_expired: c.is_expired,
        }
    }
}

/// Buyer portfolio figures. Monetary values are in gwei.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAnalytics {
    pub total_invested_gwei: u64,
    pub current_value_gwei: u64,
    pub profit_loss_gwei: i64,
    /// Rounded to two decimals; zero when nothing was invested.
    pub profit_loss_percentage: f64,
    /// Rounded to one decimal.
    pub hydrogen_offset_kg: f64,
    pub credits_count: usize,
}

#[derive(Debug, Clone)]
pub struct MarketplaceProjector {
    store: CreditStore,
    hydrogen_offset_factor: f64,
}

impl MarketplaceProjector {
    pub fn new(store: CreditStore, hydrogen_offset_factor: f64) -> Self {
        Self {
            store,
            hydrogen_offset_factor,
        }
    }

    /// Listed, unexpired credits with hydrogen left in them.
    pub fn list_available(&self) -> EngineResult<Vec<Credit>> {
        Ok(self
            .store
            .credits()?
            .into_iter()
            .filter(|c| c.request_status == RequestStatus::ForSale && c.amount_kg > 0 && !c.is_expired)
            .collect())
    }

    /// Credits `buyer` currently holds through a purchase, each with the
    /// buyer's most recent trade of it.
    pub fn list_purchased(&self, buyer: UserId) -> EngineResult<Vec<PurchasedCredit>> {
        let mut latest: HashMap<CreditId, Transaction> = HashMap::new();
        for txn in self.store.db().transactions()? {
            if txn.buyer_id == buyer {
                // Log order is append order, so later entries win.
                latest.insert(txn.credit_id, txn);
            }
        }
        Ok(self
            .store
            .credits()?
            .into_iter()
            .filter(|c| c.owner_id == buyer)
            .filter_map(|credit| {
                latest.remove(&credit.id).map(|purchase| PurchasedCredit { credit, purchase })
            })
            .collect())
    }

    pub fn portfolio_analytics(&self, buyer: UserId) -> EngineResult<PortfolioAnalytics> {
        let held = self.list_purchased(buyer)?;

        let mut invested: u64 = 0;
        let mut value: u64 = 0;
        let mut hydrogen_kg: f64 = 0.0;
        for PurchasedCredit { credit, purchase } in &held {
            invested = invested.saturating_add(purchase.total_price_gwei);
            value = value.saturating_add(market_value(credit));
            hydrogen_kg += credit.amount_kg as f64 * self.hydrogen_offset_factor;
        }

        let profit_loss = value as i128 - invested as i128;
        let percentage = if invested > 0 {
            profit_loss as f64 / invested as f64 * 100.0
        } else {
            0.0
        };

        Ok(PortfolioAnalytics {
            total_invested_gwei: invested,
            current_value_gwei: value,
            profit_loss_gwei: profit_loss.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
            profit_loss_percentage: round_to(percentage, 2),
            hydrogen_offset_kg: round_to(hydrogen_kg, 1),
            credits_count: held.len(),
        })
    }

    /// Dashboard rows for everything `creator` has issued.
    pub fn list_by_creator(&self, creator: UserId) -> EngineResult<Vec<CreditSummary>> {
        Ok(self
            .store
            .credits()?
            .iter()
            .filter(|c| c.creator_id == creator)
            .map(CreditSummary::from)
            .collect())
    }

    /// Pending credits still waiting on `auditor`'s vote.
    pub fn list_assigned(&self, auditor: UserId) -> EngineResult<Vec<Credit>> {
        Ok(self
            .store
            .credits()?
            .into_iter()
            .filter(|c| {
                c.request_status == RequestStatus::Pending
                    && !c.is_expired
                    && c.auditors_assigned.contains(&auditor)
                    && !c.auditor_votes.contains_key(&auditor)
            })
            .collect())
    }

    /// The whole trade log, newest first.
    pub fn transactions(&self) -> EngineResult<Vec<Transaction>> {
        let mut log = self.store.db().transactions()?;
        log.reverse();
        Ok(log)
    }
}

/// What the credit would fetch today: its asking price while listed, its
/// last trade price otherwise, nothing once retired.
fn market_value(credit: &Credit) -> u64 {
    if credit.is_expired {
        0
    } else {
        credit.sale_price_gwei.unwrap_or(credit.price_gwei)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::{CreditDraft, Vote};
    use crate::storage::{CreditDb, Sequence};
    use chrono::Utc;

    const NGO: UserId = UserId(1);
    const BUYER: UserId = UserId(2);
    const OTHER: UserId = UserId(3);
    const AUDITOR: UserId = UserId(9);

    struct Fixture {
        store: CreditStore,
        projector: MarketplaceProjector,
    }

    impl Fixture {
        fn new() -> Self {
            let store = CreditStore::new(CreditDb::open_temporary().unwrap());
            let projector = MarketplaceProjector::new(store.clone(), 0.5);
            Self { store, projector }
        }

        fn pending(&self, amount_kg: u64, price_gwei: u64) -> Credit {
            self.store
                .create_credit(
                    NGO,
                    CreditDraft {
                        name: format!("{amount_kg} kg"),
                        amount_kg,
                        price_gwei,
                        document_url: String::new(),
                    },
                    0,
                    [AUDITOR].into_iter().collect(),
                )
                .unwrap()
        }

        fn accepted(&self, amount_kg: u64, price_gwei: u64) -> Credit {
            let mut c = self.pending(amount_kg, price_gwei);
            c.record_vote(AUDITOR, Vote::Accept, Utc::now()).unwrap();
            self.store.save(&c).unwrap();
            c
        }

        fn listed(&self, amount_kg: u64, price_gwei: u64) -> Credit {
            let mut c = self.accepted(amount_kg, price_gwei);
            c.list_for_sale(c.owner_id, price_gwei).unwrap();
            self.store.save(&c).unwrap();
            c
        }

        fn bought(&self, buyer: UserId, amount_kg: u64, price_gwei: u64) -> Credit {
            let mut c = self.listed(amount_kg, price_gwei);
            let seller = c.owner_id;
            let paid = c.transfer_to(buyer).unwrap();
            self.store.save(&c).unwrap();
            let db = self.store.db();
            db.put_transaction(&Transaction {
                id: db.next_id(Sequence::Transaction).unwrap(),
                buyer_id: buyer,
                seller_id: seller,
                credit_id: c.id,
                amount_kg: c.amount_kg,
                total_price_gwei: paid,
                tx_hash: format!("0x{:02x}", c.id.0),
                timestamp: Utc::now(),
            })
            .unwrap();
            c
        }
    }

    #[test]
    fn available_lists_only_for_sale_credits() {
        let f = Fixture::new();
        f.pending(10, 1);
        f.accepted(20, 1);
        let listed = f.listed(30, 1);

        let available = f.projector.list_available().unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, listed.id);
    }

    #[test]
    fn purchased_joins_log_with_current_owner() {
        let f = Fixture::new();
        let mine = f.bought(BUYER, 100, 1_000);
        f.bought(OTHER, 50, 500);

        // Bought by BUYER, then resold to OTHER: no longer BUYER's.
        let mut resold = f.bought(BUYER, 70, 700);
        resold.list_for_sale(BUYER, 900).unwrap();
        f.store.save(&resold).unwrap();
        let mut resold = f.store.get_credit(resold.id).unwrap();
        resold.transfer_to(OTHER).unwrap();
        f.store.save(&resold).unwrap();

        let held = f.projector.list_purchased(BUYER).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].credit.id, mine.id);
        assert_eq!(held[0].purchase.total_price_gwei, 1_000);
    }

    #[test]
    fn analytics_are_deterministic() {
        let f = Fixture::new();
        f.bought(BUYER, 100, 1_000);
        let mut relisted = f.bought(BUYER, 40, 2_000);
        relisted.list_for_sale(BUYER, 2_500).unwrap();
        f.store.save(&relisted).unwrap();

        let a = f.projector.portfolio_analytics(BUYER).unwrap();
        assert_eq!(a.total_invested_gwei, 3_000);
        assert_eq!(a.current_value_gwei, 3_500);
        assert_eq!(a.profit_loss_gwei, 500);
        assert_eq!(a.profit_loss_percentage, 16.67);
        assert_eq!(a.hydrogen_offset_kg, 70.0);
        assert_eq!(a.credits_count, 2);
        assert_eq!(f.projector.portfolio_analytics(BUYER).unwrap(), a);
    }

    #[test]
    fn empty_portfolio_has_zero_percentage() {
        let f = Fixture::new();
        let a = f.projector.portfolio_analytics(BUYER).unwrap();
        assert_eq!(a.credits_count, 0);
        assert_eq!(a.profit_loss_percentage, 0.0);
    }

    #[test]
    fn creator_and_auditor_views() {
        let f = Fixture::new();
        let pending = f.pending(10, 1);
        f.accepted(20, 1);

        let rows = f.projector.list_by_creator(NGO).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].state, "Pending");
        assert_eq!(rows[0].auditors_left, 1);
        assert_eq!(rows[1].state, "Decided-Accepted");
        assert_eq!(rows[1].auditors_left, 0);
        assert!(f.projector.list_by_creator(BUYER).unwrap().is_empty());

        let assigned = f.projector.list_assigned(AUDITOR).unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].id, pending.id);
    }

    #[test]
    fn transactions_are_newest_first() {
        let f = Fixture::new();
        let first = f.bought(BUYER, 1, 1);
        let second = f.bought(OTHER, 1, 1);
        let log = f.projector.transactions().unwrap();
        assert_eq!(log[0].credit_id, second.id);
        assert_eq!(log[1].credit_id, first.id);
    }
}
