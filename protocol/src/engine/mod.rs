//! # Credit Lifecycle Engine
//!
//! [`CreditEngine`] is the write side of the system. It owns the credit
//! store, the ledger gateway and the per-credit locks, and every state
//! change goes through one of its operations:
//!
//! ```text
//! tally.rs       create_credit, cast_vote, auditor policy and audit fee
//! trading.rs     put_for_sale, remove_from_sale, purchase
//! expiration.rs  verify_identity, expire, certificate
//! approval.rs    production verification decisions
//! reconcile.rs   repair of local state from the ledger's view
//! ```
//!
//! ## Transition protocol
//!
//! Each transition on an existing credit:
//!
//! 1. takes the credit's lock (held until step 6 completes),
//! 2. loads the credit and keeps a snapshot,
//! 3. applies the change through a `Credit` transition method,
//! 4. saves the result flagged for reconciliation,
//! 5. mirrors the change to the ledger,
//! 6. clears the flag once the ledger has confirmed.
//!
//! If step 5 fails the snapshot is written back. When the ledger's outcome
//! is unknown (it stayed unavailable through every retry) the restored
//! record is also flagged for reconciliation. A transition abandoned during
//! step 5 (its future dropped) leaves the step-4 record flagged, as does a
//! failed restore, so the next read or transition repairs the credit from
//! the ledger's view.

mod approval;
mod expiration;
mod reconcile;
mod tally;
mod trading;

use std::future::Future;
use std::sync::Arc;

use tracing::{error, warn};

pub use expiration::Expiry;
pub use tally::AuditCapacity;
pub use trading::Purchase;

use crate::certificate::CertificateRegistry;
use crate::config::EngineConfig;
use crate::credit::Credit;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::identity::AccountDirectory;
use crate::ledger::{LedgerClient, LedgerGateway};
use crate::locks::CreditLocks;
use crate::projector::MarketplaceProjector;
use crate::storage::{CreditDb, CreditStore};
use crate::verification::{ProductionOracle, VerificationDesk};

pub struct CreditEngine {
    config: EngineConfig,
    store: CreditStore,
    accounts: AccountDirectory,
    ledger: LedgerGateway,
    locks: CreditLocks,
    certificates: CertificateRegistry,
    projector: MarketplaceProjector,
    verification: VerificationDesk,
    /// Serializes verification decisions so a request is decided once.
    decisions: tokio::sync::Mutex<()>,
}

impl CreditEngine {
    /// Wires the engine over `db`. Fails with `Validation` if `config` is
    /// inconsistent.
    pub fn new(
        db: CreditDb,
        ledger: Arc<dyn LedgerClient>,
        oracle: Arc<dyn ProductionOracle>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let store = CreditStore::new(db.clone());
        Ok(Self {
            accounts: AccountDirectory::new(db.clone(), config.credentials.clone()),
            ledger: LedgerGateway::new(ledger, config.ledger_retry.clone()),
            locks: CreditLocks::new(),
            certificates: CertificateRegistry::new(db.clone()),
            projector: MarketplaceProjector::new(store.clone(), config.hydrogen_offset_factor),
            verification: VerificationDesk::new(db, oracle, config.verification.clone()),
            decisions: tokio::sync::Mutex::new(()),
            store,
            config,
        })
    }

    // -- Accessors -----------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &CreditStore {
        &self.store
    }

    pub fn accounts(&self) -> &AccountDirectory {
        &self.accounts
    }

    pub fn projector(&self) -> &MarketplaceProjector {
        &self.projector
    }

    pub fn certificates(&self) -> &CertificateRegistry {
        &self.certificates
    }

    pub fn verification(&self) -> &VerificationDesk {
        &self.verification
    }

    pub fn ledger(&self) -> &LedgerGateway {
        &self.ledger
    }

    // -- Shared transition plumbing ------------------------------------------

    /// Persists `after` and mirrors it to the ledger through `call`.
    ///
    /// `after` is stored flagged for reconciliation and the flag is cleared
    /// only after the ledger confirms, so no window exists in which the
    /// store holds an unconfirmed transition that looks settled.
    async fn mirror<T>(
        &self,
        before: &Credit,
        after: &mut Credit,
        call: impl Future<Output = EngineResult<T>>,
    ) -> EngineResult<T> {
        after.reconciliation_needed = true;
        self.store.save(after)?;

        let confirmed = self.settle(before, call.await)?;

        after.reconciliation_needed = false;
        if let Err(e) = self.store.save(after) {
            // Still flagged: the next read reconciles to the confirmed state.
            warn!(credit_id = %after.id, error = %e, "could not clear reconciliation flag");
        }
        Ok(confirmed)
    }

    /// Undoes a saved transition after its ledger mirror failed.
    fn roll_back(&self, before: &Credit, cause: &EngineError) {
        let mut restored = before.clone();
        if cause.kind() == ErrorKind::LedgerUnavailable {
            restored.reconciliation_needed = true;
        }

        match self.store.save(&restored) {
            Ok(()) => warn!(
                credit_id = %before.id,
                error = %cause,
                flagged = restored.reconciliation_needed,
                "ledger mirror failed, transition rolled back"
            ),
            Err(restore_err) => error!(
                credit_id = %before.id,
                error = %cause,
                restore_error = %restore_err,
                "rollback failed, credit stays flagged for reconciliation"
            ),
        }
    }

    /// Passes `mirrored` through, rolling `before` back if it failed.
    fn settle<T>(&self, before: &Credit, mirrored: EngineResult<T>) -> EngineResult<T> {
        mirrored.map_err(|e| {
            self.roll_back(before, &e);
            e
        })
    }
}

impl std::fmt::Debug for CreditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditEngine")
            .field("config", &self.config)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}
