//! # Retirement Certificates
//!
//! Expiring a credit retires its hydrogen claim for good. The certificate
//! is the terminal artifact: a snapshot of the credit at the moment of
//! expiry, a display serial and a BLAKE3 fingerprint of the snapshot.
//!
//! Certificates are stored as their canonical JSON bytes, written at most
//! once per credit. Every later request returns those exact bytes, so the
//! content can never drift from the expiration moment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::credit::{Credit, CreditId};
use crate::error::{EngineError, EngineResult};
use crate::identity::UserId;
use crate::storage::{CreditDb, DbError, Sequence};

/// Immutable retirement record for one credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Display-only serial, e.g. `H2C-000042`.
    pub serial: String,
    pub credit_id: CreditId,
    pub ledger_id: u64,
    pub credit_name: String,
    pub amount_kg: u64,
    pub price_gwei: u64,
    pub document_url: String,
    pub creator_id: UserId,
    /// Holder at the time of expiry.
    pub holder_id: UserId,
    pub audit_score: i64,
    pub auditors: Vec<UserId>,
    pub expired_at: DateTime<Utc>,
    /// Hex BLAKE3 over every field above.
    pub fingerprint: String,
}

/// The fields covered by the fingerprint, in their serialized order.
#[derive(Serialize)]
struct Fingerprinted<'a> {
    serial: &'a str,
    credit_id: CreditId,
    ledger_id: u64,
    credit_name: &'a str,
    amount_kg: u64,
    price_gwei: u64,
    document_url: &'a str,
    creator_id: UserId,
    holder_id: UserId,
    audit_score: i64,
    auditors: &'a [UserId],
    expired_at: DateTime<Utc>,
}

impl Certificate {
    fn from_credit(credit: &Credit, serial: u64) -> EngineResult<Self> {
        let expired_at = credit.expired_at.ok_or_else(|| EngineError::InvalidState {
            subject: format!("credit {}", credit.id),
            current: credit.state_label(),
            expected: "Expired".into(),
        })?;
        let mut certificate = Certificate {
            serial: format!("H2C-{serial:06}"),
            credit_id: credit.id,
            ledger_id: credit.ledger_id,
            credit_name: credit.name.clone(),
            amount_kg: credit.amount_kg,
            price_gwei: credit.price_gwei,
            document_url: credit.document_url.clone(),
            creator_id: credit.creator_id,
            holder_id: credit.owner_id,
            audit_score: credit.audit_score,
            auditors: credit.auditors_assigned.iter().copied().collect(),
            expired_at,
            fingerprint: String::new(),
        };
        certificate.fingerprint = certificate.compute_fingerprint()?;
        Ok(certificate)
    }

    /// Recomputes the fingerprint from the certificate's own fields.
    pub fn compute_fingerprint(&self) -> EngineResult<String> {
        let covered = Fingerprinted {
            serial: &self.serial,
            credit_id: self.credit_id,
            ledger_id: self.ledger_id,
            credit_name: &self.credit_name,
            amount_kg: self.amount_kg,
            price_gwei: self.price_gwei,
            document_url: &self.document_url,
            creator_id: self.creator_id,
            holder_id: self.holder_id,
            audit_score: self.audit_score,
            auditors: &self.auditors,
            expired_at: self.expired_at,
        };
        let bytes = serde_json::to_vec(&covered).map_err(serialization)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn is_intact(&self) -> bool {
        self.compute_fingerprint()
            .map(|f| f == self.fingerprint)
            .unwrap_or(false)
    }
}

fn serialization(e: serde_json::Error) -> EngineError {
    EngineError::Storage(DbError::Serialization(e.to_string()))
}

/// Write-once certificate storage.
#[derive(Debug, Clone)]
pub struct CertificateRegistry {
    db: CreditDb,
}

impl CertificateRegistry {
    pub fn new(db: CreditDb) -> Self {
        Self { db }
    }

    /// Returns the stored certificate bytes for `credit`, creating them on
    /// first call. The credit must already be expired.
    pub fn issue(&self, credit: &Credit) -> EngineResult<Vec<u8>> {
        if let Some(existing) = self.db.get_certificate(credit.id)? {
            return Ok(existing);
        }
        if !credit.is_expired {
            return Err(EngineError::InvalidState {
                subject: format!("credit {}", credit.id),
                current: credit.state_label(),
                expected: "Expired".into(),
            });
        }
        let serial = self.db.next_id(Sequence::CertificateSerial)?;
        let certificate = Certificate::from_credit(credit, serial)?;
        let bytes = serde_json::to_vec(&certificate).map_err(serialization)?;
        let stored = self.db.insert_certificate(credit.id, &bytes)?;
        if stored == bytes {
            info!(
                credit_id = %credit.id,
                serial = %certificate.serial,
                "certificate issued"
            );
        }
        Ok(stored)
    }

    /// Stored bytes, if the credit has been certified.
    pub fn get_bytes(&self, credit_id: CreditId) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.db.get_certificate(credit_id)?)
    }

    pub fn get(&self, credit_id: CreditId) -> EngineResult<Option<Certificate>> {
        self.get_bytes(credit_id)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<Certificate> {
        serde_json::from_slice(bytes).map_err(serialization)
    }
}
