//! Error taxonomy for the credit lifecycle engine.
//!
//! Every engine operation returns [`EngineResult`]. Callers that need to
//! branch on the failure class (the HTTP layer, retry logic) match on
//! [`EngineError::kind`] instead of on individual variants.

use thiserror::Error;

use crate::credit::CreditId;
use crate::identity::UserId;
use crate::storage::DbError;

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; the caller can fix it and resubmit.
    Validation,
    /// The caller's identity is not allowed to perform the action.
    Unauthorized,
    /// The caller failed to prove its identity.
    Authentication,
    /// An auditor tried to vote twice.
    DuplicateVote,
    /// The transition is not legal in the entity's current state.
    InvalidState,
    /// Expiry confirmation did not name the credit correctly.
    ConfirmationMismatch,
    /// The referenced entity does not exist.
    NotFound,
    /// The ledger refused the transaction on policy grounds.
    LedgerRejected,
    /// The ledger could not be reached within the retry budget.
    LedgerUnavailable,
    /// The auditor pool is too small for the requested claim.
    InsufficientAuditors,
    /// Storage, encoding or hashing failure inside the engine.
    Internal,
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: user {actor} may not {action}")]
    Unauthorized {
        /// Who attempted the action.
        actor: UserId,
        /// What they attempted, phrased for the message.
        action: String,
    },

    #[error("authentication failed")]
    Authentication,

    #[error("auditor {auditor} already voted on credit {credit_id}")]
    DuplicateVote { credit_id: CreditId, auditor: UserId },

    #[error("invalid state: {subject} is {current}, expected {expected}")]
    InvalidState {
        /// The entity, e.g. `credit 7`.
        subject: String,
        /// Its current state.
        current: String,
        /// The state(s) the operation requires.
        expected: String,
    },

    #[error("confirmation name does not match credit {credit_id}")]
    ConfirmationMismatch { credit_id: CreditId },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("ledger rejected {operation}: {reason}")]
    LedgerRejected { operation: String, reason: String },

    #[error("ledger unavailable for {operation} after {attempts} attempt(s): {reason}")]
    LedgerUnavailable {
        operation: String,
        attempts: u32,
        reason: String,
    },

    #[error("not enough auditors: {required} required, {available} available")]
    InsufficientAuditors { required: usize, available: usize },

    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("credential hashing failed: {0}")]
    Credential(String),
}

impl EngineError {
    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Unauthorized { .. } => ErrorKind::Unauthorized,
            EngineError::Authentication => ErrorKind::Authentication,
            EngineError::DuplicateVote { .. } => ErrorKind::DuplicateVote,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::ConfirmationMismatch { .. } => ErrorKind::ConfirmationMismatch,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::LedgerRejected { .. } => ErrorKind::LedgerRejected,
            EngineError::LedgerUnavailable { .. } => ErrorKind::LedgerUnavailable,
            EngineError::InsufficientAuditors { .. } => ErrorKind::InsufficientAuditors,
            EngineError::Storage(_) | EngineError::Credential(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn unauthorized(actor: UserId, action: impl Into<String>) -> Self {
        EngineError::Unauthorized {
            actor,
            action: action.into(),
        }
    }

    pub(crate) fn credit_not_found(id: CreditId) -> Self {
        EngineError::NotFound {
            entity: "credit",
            id: id.to_string(),
        }
    }
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
