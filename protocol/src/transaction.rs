//! Append-only trade log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credit::CreditId;
use crate::identity::UserId;

/// One completed purchase. Written once after the ledger confirms the
/// trade and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub credit_id: CreditId,
    /// Hydrogen quantity that changed hands.
    pub amount_kg: u64,
    pub total_price_gwei: u64,
    /// Hash from the ledger receipt of the `buyCredit` call.
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
}
