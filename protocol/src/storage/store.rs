//! # Credit Store
//!
//! The single source of truth for credit records. Reads are public; every
//! mutator is crate-private so that only the engine's transitions (which
//! run under the per-credit lock) can change a credit. Status, owner and
//! listing changes are computed by the `Credit` transition methods and
//! written back whole through [`CreditStore::save`], so a transition is a
//! single atomic sled write.

use std::collections::BTreeSet;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::db::{CreditDb, Sequence};
use crate::credit::{Credit, CreditDraft, CreditId};
use crate::error::{EngineError, EngineResult};
use crate::identity::UserId;

#[derive(Debug, Clone)]
pub struct CreditStore {
    db: CreditDb,
    /// Outcomes for upcoming `save` calls; `false` fails the write.
    #[cfg(test)]
    save_script: Arc<parking_lot::Mutex<VecDeque<bool>>>,
}

impl CreditStore {
    pub fn new(db: CreditDb) -> Self {
        Self {
            db,
            #[cfg(test)]
            save_script: Arc::default(),
        }
    }

    pub fn db(&self) -> &CreditDb {
        &self.db
    }

    /// Fails with `NotFound` if no credit has this id.
    pub fn get_credit(&self, id: CreditId) -> EngineResult<Credit> {
        debug!(credit_id = %id, "loading credit");
        self.db
            .get_credit(id)?
            .ok_or_else(|| EngineError::credit_not_found(id))
    }

    /// Every credit in id order.
    pub fn credits(&self) -> EngineResult<Vec<Credit>> {
        Ok(self.db.credits()?)
    }

    /// The first credit `creator` issued against `document_url`, if any.
    pub fn find_by_document(&self, creator: UserId, document_url: &str) -> EngineResult<Option<Credit>> {
        Ok(self
            .db
            .credits()?
            .into_iter()
            .find(|c| c.creator_id == creator && c.document_url == document_url))
    }

    // -- Mutators (engine only) ----------------------------------------------

    /// Persists a new `Pending` credit owned by its creator.
    pub(crate) fn create_credit(
        &self,
        creator: UserId,
        draft: CreditDraft,
        ledger_id: u64,
        auditors: BTreeSet<UserId>,
    ) -> EngineResult<Credit> {
        draft.validate()?;
        let id = CreditId(self.db.next_id(Sequence::Credit)?);
        let credit = Credit::new(id, ledger_id, creator, draft, auditors, Utc::now());
        self.db.put_credit(&credit)?;
        Ok(credit)
    }

    /// Overwrites the stored record with `credit`.
    pub(crate) fn save(&self, credit: &Credit) -> EngineResult<()> {
        #[cfg(test)]
        if self.save_script.lock().pop_front() == Some(false) {
            let refused = sled::Error::Unsupported("scripted write failure".into());
            return Err(super::db::DbError::from(refused).into());
        }
        self.db.put_credit(credit)?;
        Ok(())
    }

    /// Queues outcomes for the next `save` calls, shared by every clone of
    /// this store. Unscripted saves go through.
    #[cfg(test)]
    pub(crate) fn script_saves(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.save_script.lock().extend(outcomes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CreditStore {
        CreditStore::new(CreditDb::open_temporary().unwrap())
    }

    fn draft(amount_kg: u64, price_gwei: u64) -> CreditDraft {
        CreditDraft {
            name: "Solar PEM".into(),
            amount_kg,
            price_gwei,
            document_url: "ipfs://doc".into(),
        }
    }

    fn auditors() -> BTreeSet<UserId> {
        [UserId(7), UserId(8), UserId(9)].into_iter().collect()
    }

    #[test]
    fn create_assigns_sequential_ids() {
        let store = store();
        let a = store.create_credit(UserId(1), draft(10, 1), 1, auditors()).unwrap();
        let b = store.create_credit(UserId(1), draft(20, 1), 2, auditors()).unwrap();
        assert_eq!(a.id, CreditId(1));
        assert_eq!(b.id, CreditId(2));
        assert_eq!(store.credits().unwrap().len(), 2);
    }

    #[test]
    fn create_rejects_non_positive_amount_or_price() {
        let store = store();
        assert!(matches!(
            store.create_credit(UserId(1), draft(0, 5), 1, auditors()),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            store.create_credit(UserId(1), draft(5, 0), 1, auditors()),
            Err(EngineError::Validation(_))
        ));
        assert!(store.credits().unwrap().is_empty());
    }

    #[test]
    fn missing_credit_is_not_found() {
        assert!(matches!(
            store().get_credit(CreditId(42)),
            Err(EngineError::NotFound { entity: "credit", .. })
        ));
    }

    #[test]
    fn save_and_flag_persist() {
        let store = store();
        let mut c = store.create_credit(UserId(1), draft(10, 1), 1, auditors()).unwrap();
        c.owner_id = UserId(2);
        c.reconciliation_needed = true;
        store.save(&c).unwrap();

        let reloaded = store.get_credit(c.id).unwrap();
        assert_eq!(reloaded.owner_id, UserId(2));
        assert_eq!(reloaded.creator_id, UserId(1));
        assert!(reloaded.reconciliation_needed);
    }

    #[test]
    fn find_by_document_matches_creator_and_url() {
        let store = store();
        store.create_credit(UserId(1), draft(10, 1), 1, auditors()).unwrap();
        let mut other = draft(20, 1);
        other.document_url = "verification://4".into();
        let issued = store.create_credit(UserId(1), other, 2, auditors()).unwrap();

        let found = store.find_by_document(UserId(1), "verification://4").unwrap();
        assert_eq!(found.map(|c| c.id), Some(issued.id));
        assert!(store.find_by_document(UserId(2), "verification://4").unwrap().is_none());
        assert!(store.find_by_document(UserId(1), "verification://5").unwrap().is_none());
    }

    #[test]
    fn scripted_save_failure_leaves_the_record() {
        let store = store();
        let mut c = store.create_credit(UserId(1), draft(10, 1), 1, auditors()).unwrap();
        store.clone().script_saves([false]);

        c.owner_id = UserId(2);
        assert!(matches!(store.save(&c), Err(EngineError::Storage(_))));
        assert_eq!(store.get_credit(c.id).unwrap().owner_id, UserId(1));

        store.save(&c).unwrap();
        assert_eq!(store.get_credit(c.id).unwrap().owner_id, UserId(2));
    }
}
