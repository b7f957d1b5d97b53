//! # Engine Configuration & Constants
//!
//! Compile-time defaults live as constants at the top of this file. The
//! tunable parts of the engine (how many auditors a claim needs, what an
//! audit costs, how hard we retry the ledger) are runtime policy in
//! [`EngineConfig`], loaded from TOML so operators can retune thresholds
//! without shipping a new build.
//!
//! ```toml
//! hydrogen_offset_factor = 0.5
//!
//! [[auditor_policy]]
//! min_amount_kg = 0
//! auditors = 3
//!
//! [[auditor_policy]]
//! min_amount_kg = 500
//! auditors = 5
//!
//! [ledger_retry]
//! max_attempts = 4
//! initial_delay_ms = 50
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

/// Engine version reported by the node's status endpoints.
pub const ENGINE_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Receipt status the ledger reports for a mined, successful transaction.
/// Anything else is a revert.
pub const LEDGER_SUCCESS_STATUS: u8 = 1;

/// Gwei per ETH. Prices are carried as integer gwei so no float ever
/// touches a balance.
pub const GWEI_PER_ETH: u64 = 1_000_000_000;

/// Default number of attempts (first call included) for a ledger call that
/// keeps failing with a transient error.
pub const DEFAULT_LEDGER_MAX_ATTEMPTS: u32 = 4;

/// Backoff before the first retry.
pub const DEFAULT_LEDGER_INITIAL_DELAY_MS: u64 = 50;

/// Upper bound for a single backoff sleep.
pub const DEFAULT_LEDGER_MAX_DELAY_MS: u64 = 2_000;

/// Exponential growth factor between retries.
pub const DEFAULT_LEDGER_BACKOFF_MULTIPLIER: f64 = 2.0;

// ---------------------------------------------------------------------------
// Audit economics
// ---------------------------------------------------------------------------

/// Audit fee rate in basis points of the credit's total listed value.
pub const DEFAULT_AUDIT_FEE_BPS: u32 = 100;

/// Floor for the audit fee, in gwei (0.001 ETH).
pub const DEFAULT_MIN_AUDIT_FEE_GWEI: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

/// Kilograms of hydrogen offset credited per kilogram held.
pub const DEFAULT_HYDROGEN_OFFSET_FACTOR: f64 = 0.5;

// ---------------------------------------------------------------------------
// Production verification
// ---------------------------------------------------------------------------

/// Minimum oracle validity score for a production claim to stay pending.
pub const DEFAULT_VALIDITY_THRESHOLD: f64 = 0.85;

/// Fraud probability at or above which a claim is rejected on submission.
pub const DEFAULT_FRAUD_THRESHOLD: f64 = 0.7;

/// Price per verified kilogram for credits minted from approved claims.
pub const DEFAULT_PRICE_PER_KG_GWEI: u64 = 2_500_000;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Argon2id memory cost in KiB.
pub const DEFAULT_CREDENTIAL_MEMORY_KIB: u32 = 19_456;

/// Argon2id passes over memory.
pub const DEFAULT_CREDENTIAL_ITERATIONS: u32 = 2;

/// Argon2id lanes.
pub const DEFAULT_CREDENTIAL_PARALLELISM: u32 = 1;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Default REST API port.
pub const DEFAULT_API_PORT: u16 = 8780;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 8781;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Auditor policy
// ---------------------------------------------------------------------------

/// One row of the auditor policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditorTier {
    /// Smallest claim (inclusive) this tier applies to.
    pub min_amount_kg: u64,
    /// Independent auditors required for claims in this tier.
    pub auditors: usize,
}

/// Maps a claim size to the number of auditors that must vote on it.
///
/// Tiers are sorted by `min_amount_kg`; the last tier whose threshold is at
/// or below the claimed amount wins. The first tier must start at zero so
/// every amount is covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditorPolicy {
    tiers: Vec<AuditorTier>,
}

impl AuditorPolicy {
    /// Builds a policy from a tier table, rejecting tables that leave gaps
    /// or contain zero-auditor tiers.
    pub fn new(mut tiers: Vec<AuditorTier>) -> Result<Self, ConfigError> {
        tiers.sort_by_key(|t| t.min_amount_kg);
        let policy = Self { tiers };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let first = self
            .tiers
            .first()
            .ok_or_else(|| ConfigError::Invalid("auditor policy has no tiers".into()))?;
        if first.min_amount_kg != 0 {
            return Err(ConfigError::Invalid(format!(
                "first auditor tier must start at 0 kg, starts at {}",
                first.min_amount_kg
            )));
        }
        for pair in self.tiers.windows(2) {
            if pair[0].min_amount_kg >= pair[1].min_amount_kg {
                return Err(ConfigError::Invalid(format!(
                    "auditor tiers must have distinct thresholds (duplicate {} kg)",
                    pair[1].min_amount_kg
                )));
            }
        }
        if let Some(tier) = self.tiers.iter().find(|t| t.auditors == 0) {
            return Err(ConfigError::Invalid(format!(
                "auditor tier at {} kg requires zero auditors",
                tier.min_amount_kg
            )));
        }
        Ok(())
    }

    /// Number of distinct auditors a claim of `amount_kg` requires.
    pub fn required_auditors(&self, amount_kg: u64) -> usize {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.min_amount_kg <= amount_kg)
            .map(|t| t.auditors)
            // validate() guarantees a zero tier; this only covers an empty
            // table built through deserialization without validation.
            .unwrap_or(1)
    }

    /// The tiers in ascending threshold order.
    pub fn tiers(&self) -> &[AuditorTier] {
        &self.tiers
    }
}

impl Default for AuditorPolicy {
    /// Three auditors for small claims, two more for every further 500 kg,
    /// capped at fifteen.
    fn default() -> Self {
        let tiers = [(0, 3), (500, 5), (1_000, 7), (1_500, 9), (2_000, 11), (5_000, 15)]
            .into_iter()
            .map(|(min_amount_kg, auditors)| AuditorTier {
                min_amount_kg,
                auditors,
            })
            .collect();
        Self { tiers }
    }
}

// ---------------------------------------------------------------------------
// Audit fee
// ---------------------------------------------------------------------------

/// Fee the creator escrows on the ledger when requesting an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFeePolicy {
    /// Rate over `price * amount`, in basis points.
    pub rate_bps: u32,
    /// Minimum fee in gwei.
    pub minimum_gwei: u64,
}

impl AuditFeePolicy {
    /// Fee in gwei for a claim of `amount_kg` listed at `price_gwei` per unit.
    pub fn fee_for(&self, amount_kg: u64, price_gwei: u64) -> u64 {
        let value = u128::from(amount_kg) * u128::from(price_gwei);
        let fee = value * u128::from(self.rate_bps) / 10_000;
        u64::try_from(fee).unwrap_or(u64::MAX).max(self.minimum_gwei)
    }
}

impl Default for AuditFeePolicy {
    fn default() -> Self {
        Self {
            rate_bps: DEFAULT_AUDIT_FEE_BPS,
            minimum_gwei: DEFAULT_MIN_AUDIT_FEE_GWEI,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for transient ledger failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Retries without sleeping. Handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_LEDGER_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_LEDGER_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_LEDGER_MAX_DELAY_MS,
            multiplier: DEFAULT_LEDGER_BACKOFF_MULTIPLIER,
        }
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Thresholds applied to oracle output for production claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationPolicy {
    pub validity_threshold: f64,
    pub fraud_threshold: f64,
    pub price_per_kg_gwei: u64,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            validity_threshold: DEFAULT_VALIDITY_THRESHOLD,
            fraud_threshold: DEFAULT_FRAUD_THRESHOLD,
            price_per_kg_gwei: DEFAULT_PRICE_PER_KG_GWEI,
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Argon2id cost for hashing new account secrets. Stored hashes carry their
/// own parameters, so retuning only affects accounts registered afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialPolicy {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl CredentialPolicy {
    /// The cheapest parameters Argon2 accepts. Handy in tests.
    pub fn minimal() -> Self {
        Self {
            memory_kib: argon2::Params::MIN_M_COST,
            iterations: argon2::Params::MIN_T_COST,
            parallelism: argon2::Params::MIN_P_COST,
        }
    }

    pub fn params(&self) -> Result<argon2::Params, ConfigError> {
        argon2::Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| ConfigError::Invalid(format!("credential policy: {e}")))
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_CREDENTIAL_MEMORY_KIB,
            iterations: DEFAULT_CREDENTIAL_ITERATIONS,
            parallelism: DEFAULT_CREDENTIAL_PARALLELISM,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Runtime configuration of the credit lifecycle engine.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Scalars first: TOML cannot emit a bare key after a table.
    pub hydrogen_offset_factor: f64,
    pub auditor_policy: AuditorPolicy,
    pub audit_fee: AuditFeePolicy,
    pub ledger_retry: RetryPolicy,
    pub verification: VerificationPolicy,
    pub credentials: CredentialPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hydrogen_offset_factor: DEFAULT_HYDROGEN_OFFSET_FACTOR,
            auditor_policy: AuditorPolicy::default(),
            audit_fee: AuditFeePolicy::default(),
            ledger_retry: RetryPolicy::default(),
            verification: VerificationPolicy::default(),
            credentials: CredentialPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Renders the config as TOML, e.g. for `h2credit-node init`.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auditor_policy.validate()?;
        if self.ledger_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ledger_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.ledger_retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "ledger_retry.multiplier must be >= 1.0".into(),
            ));
        }
        if !(self.hydrogen_offset_factor.is_finite() && self.hydrogen_offset_factor >= 0.0) {
            return Err(ConfigError::Invalid(
                "hydrogen_offset_factor must be a non-negative number".into(),
            ));
        }
        let v = &self.verification;
        if !(0.0..=1.0).contains(&v.validity_threshold) || !(0.0..=1.0).contains(&v.fraud_threshold)
        {
            return Err(ConfigError::Invalid(
                "verification thresholds must lie in [0, 1]".into(),
            ));
        }
        self.credentials.params()?;
        Ok(())
    }
}
