//! # Ledger Gateway
//!
//! The blockchain contract that records credits, audits, listings and
//! transfers is an external collaborator. The engine talks to it only
//! through the [`LedgerClient`] trait, and only via the retrying
//! [`LedgerGateway`], which turns transport and policy failures into the
//! two classified errors the engine acts on:
//!
//! - **rejected**: the contract refused the transaction (wrong caller,
//!   already audited, insufficient value). Never retried.
//! - **unavailable**: the call did not reach a verdict. Retried with
//!   bounded exponential backoff, then surfaced.
//!
//! ```text
//! engine ──► LedgerGateway ──► Arc<dyn LedgerClient>
//!              │ retry/backoff      ├── InMemoryLedger (tests, devnet)
//!              │ receipt.status     └── chain RPC client
//! ```

pub mod gateway;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LEDGER_SUCCESS_STATUS;
use crate::credit::Vote;
use crate::identity::UserId;

pub use gateway::LedgerGateway;
pub use memory::{Fault, InMemoryLedger};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Contract operations, named as the contract names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerOp {
    GenerateCredit,
    SellCredit,
    BuyCredit,
    RemoveFromSale,
    Expire,
    RequestAudit,
    AuditCredit,
    Credits,
    GetPrice,
    GetAuditorList,
}

impl fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedgerOp::GenerateCredit => "generateCredit",
            LedgerOp::SellCredit => "sellCredit",
            LedgerOp::BuyCredit => "buyCredit",
            LedgerOp::RemoveFromSale => "removeFromSale",
            LedgerOp::Expire => "expire",
            LedgerOp::RequestAudit => "requestAudit",
            LedgerOp::AuditCredit => "auditCredit",
            LedgerOp::Credits => "credits",
            LedgerOp::GetPrice => "getPrice",
            LedgerOp::GetAuditorList => "getAuditorList",
        };
        f.write_str(name)
    }
}

/// Outcome of a state-changing contract call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// `1` on success, anything else is a rejection.
    pub status: u8,
    pub tx_hash: String,
    /// Set by `generateCredit`: the id the ledger assigned.
    pub credit_id: Option<u64>,
    /// Revert reason, when the ledger gives one.
    pub reason: Option<String>,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.status == LEDGER_SUCCESS_STATUS
    }
}

/// The ledger's own record of a credit, as returned by `credits(id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCredit {
    pub id: u64,
    pub creator: UserId,
    pub owner: UserId,
    pub amount_kg: u64,
    /// Listing price while for sale, otherwise the last recorded price.
    pub price_gwei: u64,
    pub for_sale: bool,
    pub expired: bool,
    pub audit_fee_gwei: u64,
    pub auditors: Vec<UserId>,
    /// Ballots in the order the ledger accepted them.
    pub votes: Vec<(UserId, Vote)>,
}

impl LedgerCredit {
    pub fn audit_score(&self) -> i64 {
        self.votes.iter().map(|(_, v)| v.weight()).sum()
    }
}

/// Failure of a ledger call before any receipt was produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("{operation} rejected: {reason}")]
    Rejected { operation: LedgerOp, reason: String },

    #[error("{operation} unavailable: {reason}")]
    Unavailable { operation: LedgerOp, reason: String },
}

// ---------------------------------------------------------------------------
// LedgerClient
// ---------------------------------------------------------------------------

/// Transport to the ledger contract. `caller` is the identity the contract
/// sees as the transaction sender.
///
/// Implementations report policy refusals either as a receipt with a
/// non-success status or as [`LedgerError::Rejected`]; the gateway treats
/// both the same way.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn generate_credit(
        &self,
        caller: UserId,
        amount_kg: u64,
        price_gwei: u64,
    ) -> Result<Receipt, LedgerError>;

    async fn sell_credit(
        &self,
        caller: UserId,
        credit_id: u64,
        price_gwei: u64,
    ) -> Result<Receipt, LedgerError>;

    /// `value_gwei` is the payment attached to the call.
    async fn buy_credit(
        &self,
        caller: UserId,
        credit_id: u64,
        value_gwei: u64,
    ) -> Result<Receipt, LedgerError>;

    async fn remove_from_sale(&self, caller: UserId, credit_id: u64) -> Result<Receipt, LedgerError>;

    async fn expire(&self, caller: UserId, credit_id: u64) -> Result<Receipt, LedgerError>;

    /// Pays the audit fee and registers the auditors allowed to vote.
    async fn request_audit(
        &self,
        caller: UserId,
        credit_id: u64,
        fee_gwei: u64,
        auditors: Vec<UserId>,
    ) -> Result<Receipt, LedgerError>;

    async fn audit_credit(
        &self,
        caller: UserId,
        credit_id: u64,
        vote: Vote,
    ) -> Result<Receipt, LedgerError>;

    async fn credit(&self, credit_id: u64) -> Result<Option<LedgerCredit>, LedgerError>;

    async fn price(&self, credit_id: u64) -> Result<u64, LedgerError>;

    async fn auditor_list(&self, credit_id: u64) -> Result<Vec<UserId>, LedgerError>;
}
