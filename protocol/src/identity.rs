//! # Accounts & Sessions
//!
//! Users of the marketplace fall into three roles: NGOs that produce and
//! retire credits, buyers that trade them, and auditors that vote on them.
//! A [`Session`] is the explicit, per-request proof of who is acting; engine
//! operations take it as an argument instead of reading ambient state.
//!
//! Secrets are never stored. Each account keeps an Argon2id hash in PHC
//! string form, which carries its own salt and cost parameters.

use std::fmt;
use std::str::FromStr;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Version};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CredentialPolicy;
use crate::error::{EngineError, EngineResult};
use crate::storage::{CreditDb, Sequence};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identifier of a registered account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an account is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "NGO")]
    Ngo,
    #[serde(rename = "buyer")]
    Buyer,
    #[serde(rename = "auditor")]
    Auditor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Ngo => write!(f, "NGO"),
            Role::Buyer => write!(f, "buyer"),
            Role::Auditor => write!(f, "auditor"),
        }
    }
}

impl FromStr for Role {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ngo" => Ok(Role::Ngo),
            "buyer" => Ok(Role::Buyer),
            "auditor" => Ok(Role::Auditor),
            other => Err(EngineError::Validation(format!("unknown role `{other}`"))),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

impl Session {
    /// Fails with `Unauthorized` unless the session holds `role`.
    pub fn require(&self, role: Role, action: &str) -> EngineResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(EngineError::unauthorized(
                self.user_id,
                format!("{action} as {}", self.role),
            ))
        }
    }
}

/// A stored account record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    /// Argon2id hash of the secret, PHC string format.
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn session(&self) -> Session {
        Session {
            user_id: self.id,
            username: self.username.clone(),
            role: self.role,
        }
    }

    fn secret_matches(&self, secret: &str) -> bool {
        let stored = match PasswordHash::new(&self.secret_hash) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(user_id = %self.id, error = %e, "stored secret hash is unreadable");
                return false;
            }
        };
        // Cost parameters come from the stored hash.
        Argon2::default()
            .verify_password(secret.as_bytes(), &stored)
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// AccountDirectory
// ---------------------------------------------------------------------------

/// Registration, authentication and the auditor pool.
#[derive(Debug, Clone)]
pub struct AccountDirectory {
    db: CreditDb,
    credentials: CredentialPolicy,
}

impl AccountDirectory {
    pub fn new(db: CreditDb, credentials: CredentialPolicy) -> Self {
        Self { db, credentials }
    }

    fn hash_secret(&self, secret: &str) -> EngineResult<String> {
        let params = self
            .credentials
            .params()
            .map_err(|e| EngineError::Credential(e.to_string()))?;
        let salt = SaltString::generate(&mut OsRng);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| EngineError::Credential(e.to_string()))
    }

    /// Creates an account. Usernames are unique and case-sensitive.
    pub fn register(&self, username: &str, secret: &str, role: Role) -> EngineResult<Account> {
        let username = username.trim();
        if username.is_empty() {
            return Err(EngineError::Validation("username must not be empty".into()));
        }
        if secret.is_empty() {
            return Err(EngineError::Validation("secret must not be empty".into()));
        }

        let secret_hash = self.hash_secret(secret)?;
        let id = UserId(self.db.next_id(Sequence::Account)?);
        if !self.db.claim_username(username, id)? {
            return Err(EngineError::Validation(format!(
                "username `{username}` is already taken"
            )));
        }

        let account = Account {
            id,
            username: username.to_string(),
            role,
            secret_hash,
            created_at: Utc::now(),
        };
        self.db.put_account(&account)?;
        info!(user_id = %id, %role, "account registered");
        Ok(account)
    }

    /// Exchanges credentials for a session.
    pub fn authenticate(&self, username: &str, secret: &str) -> EngineResult<Session> {
        let account = self
            .db
            .user_id_for(username.trim())?
            .map(|id| self.db.get_account(id))
            .transpose()?
            .flatten()
            .ok_or(EngineError::Authentication)?;
        if !account.secret_matches(secret) {
            debug!(user_id = %account.id, "rejected login");
            return Err(EngineError::Authentication);
        }
        Ok(account.session())
    }

    /// Re-confirms an already-authenticated user's secret.
    pub fn verify_secret(&self, user_id: UserId, secret: &str) -> EngineResult<()> {
        let account = self.get(user_id)?;
        if account.secret_matches(secret) {
            Ok(())
        } else {
            Err(EngineError::Authentication)
        }
    }

    pub fn get(&self, user_id: UserId) -> EngineResult<Account> {
        self.db
            .get_account(user_id)?
            .ok_or_else(|| EngineError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            })
    }

    /// Every registered auditor, in registration order.
    pub fn auditors(&self) -> EngineResult<Vec<UserId>> {
        Ok(self
            .db
            .accounts()?
            .into_iter()
            .filter(|a| a.role == Role::Auditor)
            .map(|a| a.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> AccountDirectory {
        AccountDirectory::new(CreditDb::open_temporary().unwrap(), CredentialPolicy::minimal())
    }

    #[test]
    fn register_and_authenticate() {
        let dir = directory();
        let account = dir.register("greenfield", "s3cret", Role::Ngo).unwrap();
        assert!(account.secret_hash.starts_with("$argon2id$"));
        assert!(!account.secret_hash.contains("s3cret"));

        let session = dir.authenticate("greenfield", "s3cret").unwrap();
        assert_eq!(session.user_id, account.id);
        assert_eq!(session.role, Role::Ngo);
    }

    #[test]
    fn wrong_secret_or_unknown_user_fails_authentication() {
        let dir = directory();
        dir.register("buyer-1", "pw", Role::Buyer).unwrap();
        assert!(matches!(
            dir.authenticate("buyer-1", "nope"),
            Err(EngineError::Authentication)
        ));
        assert!(matches!(
            dir.authenticate("ghost", "pw"),
            Err(EngineError::Authentication)
        ));
    }

    #[test]
    fn duplicate_and_empty_usernames_are_rejected() {
        let dir = directory();
        dir.register("dup", "pw", Role::Buyer).unwrap();
        assert!(matches!(
            dir.register("dup", "other", Role::Auditor),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            dir.register("  ", "pw", Role::Buyer),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            dir.register("x", "", Role::Buyer),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn same_secret_hashes_differently_per_account() {
        let dir = directory();
        let a = dir.register("a", "shared", Role::Buyer).unwrap();
        let b = dir.register("b", "shared", Role::Buyer).unwrap();
        assert_ne!(a.secret_hash, b.secret_hash);
    }

    #[test]
    fn hashes_record_the_configured_cost() {
        let policy = CredentialPolicy {
            memory_kib: 64,
            iterations: 3,
            parallelism: 1,
        };
        let dir = AccountDirectory::new(CreditDb::open_temporary().unwrap(), policy);
        let account = dir.register("costly", "pw", Role::Buyer).unwrap();
        assert!(account.secret_hash.contains("m=64,t=3,p=1"));

        // Verification reads the cost back from the hash.
        let relaxed = AccountDirectory::new(dir.db.clone(), CredentialPolicy::minimal());
        assert!(relaxed.authenticate("costly", "pw").is_ok());
    }

    #[test]
    fn unreadable_stored_hash_never_matches() {
        let dir = directory();
        let mut account = dir.register("legacy", "pw", Role::Ngo).unwrap();
        account.secret_hash = "not-a-phc-string".into();
        dir.db.put_account(&account).unwrap();
        assert!(matches!(
            dir.authenticate("legacy", "pw"),
            Err(EngineError::Authentication)
        ));
    }

    #[test]
    fn verify_secret_checks_the_stored_digest() {
        let dir = directory();
        let ngo = dir.register("ngo", "pw", Role::Ngo).unwrap();
        assert!(dir.verify_secret(ngo.id, "pw").is_ok());
        assert!(matches!(
            dir.verify_secret(ngo.id, "PW"),
            Err(EngineError::Authentication)
        ));
        assert!(matches!(
            dir.verify_secret(UserId(999), "pw"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn auditor_pool_lists_only_auditors() {
        let dir = directory();
        dir.register("ngo", "pw", Role::Ngo).unwrap();
        let a1 = dir.register("aud-1", "pw", Role::Auditor).unwrap();
        dir.register("buyer", "pw", Role::Buyer).unwrap();
        let a2 = dir.register("aud-2", "pw", Role::Auditor).unwrap();
        assert_eq!(dir.auditors().unwrap(), vec![a1.id, a2.id]);
    }

    #[test]
    fn role_parsing_and_gating() {
        assert_eq!("NGO".parse::<Role>().unwrap(), Role::Ngo);
        assert_eq!("Auditor".parse::<Role>().unwrap(), Role::Auditor);
        assert!("admin".parse::<Role>().is_err());

        let session = Session {
            user_id: UserId(1),
            username: "b".into(),
            role: Role::Buyer,
        };
        assert!(session.require(Role::Buyer, "purchase").is_ok());
        assert!(matches!(
            session.require(Role::Ngo, "create credits"),
            Err(EngineError::Unauthorized { .. })
        ));
    }
}
