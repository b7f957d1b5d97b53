//! # CreditDb: Persistent Storage Engine
//!
//! The persistence layer for the credit engine, built on sled's embedded
//! key-value store. All on-disk data flows through this module.
//!
//! ## Tree Layout
//!
//! | Tree            | Key                     | Value                        |
//! |-----------------|-------------------------|------------------------------|
//! | `credits`       | `credit_id` (8B BE)     | `bincode(Credit)`            |
//! | `transactions`  | `txn_id` (8B BE)        | `bincode(Transaction)`       |
//! | `verifications` | `request_id` (8B BE)    | `bincode(VerificationRequest)` |
//! | `certificates`  | `credit_id` (8B BE)     | canonical certificate bytes  |
//! | `accounts`      | `user_id` (8B BE)       | `bincode(Account)`           |
//! | `usernames`     | username (UTF-8)        | `user_id` (8B BE)            |
//! | `metadata`      | key (UTF-8)             | sequence counters            |
//!
//! Identifiers are big-endian u64 so sled's lexicographic ordering matches
//! numeric ordering and listings come back in creation order.
//!
//! ## Atomicity
//!
//! Single-key writes are atomic in sled. Uniqueness claims (usernames,
//! first certificate for a credit) use compare-and-swap against an absent
//! key so two racing writers cannot both win. Multi-step credit
//! transitions are serialized one level up by the engine's per-credit
//! locks, not here.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::Path;

use crate::credit::{Credit, CreditId};
use crate::identity::{Account, UserId};
use crate::transaction::Transaction;
use crate::verification::{VerificationId, VerificationRequest};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

/// Named id sequences kept in the `metadata` tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Credit,
    Transaction,
    Verification,
    Account,
    CertificateSerial,
}

impl Sequence {
    fn key(self) -> &'static [u8] {
        match self {
            Sequence::Credit => b"seq_credit",
            Sequence::Transaction => b"seq_transaction",
            Sequence::Verification => b"seq_verification",
            Sequence::Account => b"seq_account",
            Sequence::CertificateSerial => b"seq_certificate_serial",
        }
    }
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> DbResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::Serialization("invalid u64 bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

// ---------------------------------------------------------------------------
// CreditDb
// ---------------------------------------------------------------------------

/// Persistent storage for credits, trades, verification requests,
/// certificates and accounts.
///
/// Cloning is cheap: sled handles are reference counted, so every
/// component of the engine holds its own `CreditDb` over the same trees.
#[derive(Debug, Clone)]
pub struct CreditDb {
    db: Db,
    credits: Tree,
    transactions: Tree,
    verifications: Tree,
    certificates: Tree,
    accounts: Tree,
    usernames: Tree,
    metadata: Tree,
}

impl CreditDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is removed when dropped.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            credits: db.open_tree("credits")?,
            transactions: db.open_tree("transactions")?,
            verifications: db.open_tree("verifications")?,
            certificates: db.open_tree("certificates")?,
            accounts: db.open_tree("accounts")?,
            usernames: db.open_tree("usernames")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    /// Atomically advance a sequence and return the new value. Sequences
    /// start at 1.
    pub fn next_id(&self, seq: Sequence) -> DbResult<u64> {
        let updated = self.metadata.update_and_fetch(seq.key(), |old| {
            let current = old
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some((current + 1).to_be_bytes().to_vec())
        })?;
        match updated {
            Some(bytes) => decode_u64(&bytes),
            None => Err(DbError::Serialization("sequence vanished".to_string())),
        }
    }

    // -- Credit operations ---------------------------------------------------

    pub fn put_credit(&self, credit: &Credit) -> DbResult<()> {
        self.credits.insert(credit.id.to_key(), encode(credit)?)?;
        Ok(())
    }

    pub fn get_credit(&self, id: CreditId) -> DbResult<Option<Credit>> {
        self.credits
            .get(id.to_key())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// All credits in id order.
    pub fn credits(&self) -> DbResult<Vec<Credit>> {
        self.scan(&self.credits)
    }

    // -- Transaction operations ----------------------------------------------

    pub fn put_transaction(&self, txn: &Transaction) -> DbResult<()> {
        self.transactions.insert(txn.id.to_be_bytes(), encode(txn)?)?;
        Ok(())
    }

    /// All trades in id (append) order.
    pub fn transactions(&self) -> DbResult<Vec<Transaction>> {
        self.scan(&self.transactions)
    }

    // -- Verification operations ---------------------------------------------

    pub fn put_verification(&self, request: &VerificationRequest) -> DbResult<()> {
        self.verifications
            .insert(request.id.to_key(), encode(request)?)?;
        Ok(())
    }

    pub fn get_verification(&self, id: VerificationId) -> DbResult<Option<VerificationRequest>> {
        self.verifications
            .get(id.to_key())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn verifications(&self) -> DbResult<Vec<VerificationRequest>> {
        self.scan(&self.verifications)
    }

    // -- Certificate operations ----------------------------------------------

    /// Stores `bytes` as the certificate of `credit_id` unless one already
    /// exists. Returns the bytes that ended up stored.
    pub fn insert_certificate(&self, credit_id: CreditId, bytes: &[u8]) -> DbResult<Vec<u8>> {
        let swapped =
            self.certificates
                .compare_and_swap(credit_id.to_key(), None as Option<&[u8]>, Some(bytes))?;
        match swapped {
            Ok(()) => Ok(bytes.to_vec()),
            Err(conflict) => Ok(conflict
                .current
                .map(|current| current.to_vec())
                .unwrap_or_else(|| bytes.to_vec())),
        }
    }

    pub fn get_certificate(&self, credit_id: CreditId) -> DbResult<Option<Vec<u8>>> {
        Ok(self
            .certificates
            .get(credit_id.to_key())?
            .map(|bytes| bytes.to_vec()))
    }

    // -- Account operations --------------------------------------------------

    /// Reserves `username` for `user_id`. Returns `false` if it was taken.
    pub fn claim_username(&self, username: &str, user_id: UserId) -> DbResult<bool> {
        let swapped = self.usernames.compare_and_swap(
            username.as_bytes(),
            None as Option<&[u8]>,
            Some(&user_id.0.to_be_bytes()[..]),
        )?;
        Ok(swapped.is_ok())
    }

    pub fn user_id_for(&self, username: &str) -> DbResult<Option<UserId>> {
        self.usernames
            .get(username.as_bytes())?
            .map(|bytes| decode_u64(&bytes).map(UserId))
            .transpose()
    }

    pub fn put_account(&self, account: &Account) -> DbResult<()> {
        self.accounts
            .insert(account.id.0.to_be_bytes(), encode(account)?)?;
        Ok(())
    }

    pub fn get_account(&self, id: UserId) -> DbResult<Option<Account>> {
        self.accounts
            .get(id.0.to_be_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn accounts(&self) -> DbResult<Vec<Account>> {
        self.scan(&self.accounts)
    }

    // -- Utility operations --------------------------------------------------

    pub fn credit_count(&self) -> usize {
        self.credits.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Block until all pending writes are durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, tree: &Tree) -> DbResult<Vec<T>> {
        let mut out = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (_key, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
