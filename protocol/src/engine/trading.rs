//! Marketplace transitions: listing, delisting and purchase.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::CreditEngine;
use crate::credit::{Credit, CreditId};
use crate::error::EngineResult;
use crate::identity::{Role, Session};
use crate::storage::Sequence;
use crate::transaction::Transaction;

/// A completed purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub credit: Credit,
    pub transaction: Transaction,
}

impl CreditEngine {
    /// Lists an accepted credit the caller owns.
    pub async fn put_for_sale(
        &self,
        session: &Session,
        credit_id: CreditId,
        price_gwei: u64,
    ) -> EngineResult<Credit> {
        let _guard = self.locks.acquire(credit_id).await;
        let mut credit = self.load_for_transition(credit_id).await?;
        let before = credit.clone();

        credit.list_for_sale(session.user_id, price_gwei)?;
        let call = self
            .ledger
            .sell_credit(session.user_id, credit.ledger_id, price_gwei);
        self.mirror(&before, &mut credit, call).await?;

        info!(credit_id = %credit_id, owner = %session.user_id, price_gwei, "credit listed");
        Ok(credit)
    }

    /// Withdraws the caller's listing.
    pub async fn remove_from_sale(&self, session: &Session, credit_id: CreditId) -> EngineResult<Credit> {
        let _guard = self.locks.acquire(credit_id).await;
        let mut credit = self.load_for_transition(credit_id).await?;
        let before = credit.clone();

        credit.delist(session.user_id)?;
        let call = self
            .ledger
            .remove_from_sale(session.user_id, credit.ledger_id);
        self.mirror(&before, &mut credit, call).await?;

        info!(credit_id = %credit_id, owner = %session.user_id, "credit delisted");
        Ok(credit)
    }

    /// Buys a listed credit at its asking price.
    pub async fn purchase(&self, session: &Session, credit_id: CreditId) -> EngineResult<Purchase> {
        session.require(Role::Buyer, "purchase credits")?;

        let _guard = self.locks.acquire(credit_id).await;
        let mut credit = self.load_for_transition(credit_id).await?;
        let before = credit.clone();

        let paid = credit.transfer_to(session.user_id)?;
        let call = self
            .ledger
            .buy_credit(session.user_id, credit.ledger_id, paid);
        let receipt = self.mirror(&before, &mut credit, call).await?;

        let transaction = Transaction {
            id: self.store.db().next_id(Sequence::Transaction)?,
            buyer_id: session.user_id,
            seller_id: before.owner_id,
            credit_id,
            amount_kg: credit.amount_kg,
            total_price_gwei: paid,
            tx_hash: receipt.tx_hash,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.db().put_transaction(&transaction) {
            // The trade stands on the ledger and in the store; only the
            // log entry is missing.
            error!(credit_id = %credit_id, tx_hash = %transaction.tx_hash, error = %e, "failed to append trade log");
            return Err(e.into());
        }

        info!(
            credit_id = %credit_id,
            buyer = %session.user_id,
            seller = %before.owner_id,
            price_gwei = paid,
            tx_hash = %transaction.tx_hash,
            "credit purchased"
        );
        Ok(Purchase { credit, transaction })
    }
}
