//! # Production Verification
//!
//! Before an industry's production claim becomes a credit it is scored by
//! a [`ProductionOracle`] and, if the score clears the configured gates,
//! queued for a human auditor. Approval turns the claim into an ordinary
//! credit that still goes through the quorum audit; the engine owns that
//! step (see `CreditEngine::approve_verification`).
//!
//! ```text
//! submit ──► oracle ──► Pending ──► approve ──► Approved (+ credit)
//!               │          └──────► reject  ──► Rejected
//!               └─ below gate ────────────────► Rejected
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::VerificationPolicy;
use crate::credit::CreditId;
use crate::error::{EngineError, EngineResult};
use crate::identity::{Role, Session, UserId};
use crate::storage::{CreditDb, Sequence};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationId(pub u64);

impl VerificationId {
    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for VerificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationStatus::Pending => write!(f, "Pending"),
            VerificationStatus::Approved => write!(f, "Approved"),
            VerificationStatus::Rejected => write!(f, "Rejected"),
        }
    }
}

/// What an industry says it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionClaim {
    pub production_method: String,
    pub hydrogen_amount_kg: u64,
    /// Renewable energy consumed to produce it.
    pub energy_mwh: f64,
}

impl ProductionClaim {
    pub fn validate(&self) -> EngineResult<()> {
        if self.production_method.trim().is_empty() {
            return Err(EngineError::Validation("production method must not be empty".into()));
        }
        if self.hydrogen_amount_kg == 0 {
            return Err(EngineError::Validation("hydrogen amount must be positive".into()));
        }
        if !self.energy_mwh.is_finite() || self.energy_mwh <= 0.0 {
            return Err(EngineError::Validation("energy input must be positive".into()));
        }
        Ok(())
    }

    /// Specific energy consumption in kWh per kg of hydrogen.
    pub fn kwh_per_kg(&self) -> f64 {
        self.energy_mwh * 1000.0 / self.hydrogen_amount_kg as f64
    }
}

/// Oracle output, both in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OracleAssessment {
    pub validity_score: f64,
    pub fraud_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub id: VerificationId,
    pub industry_id: UserId,
    pub claim: ProductionClaim,
    pub validity_score: f64,
    pub fraud_probability: f64,
    pub status: VerificationStatus,
    pub auditor_id: Option<UserId>,
    pub notes: Option<String>,
    /// Credit synthesized on approval.
    pub credit_id: Option<CreditId>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Scores production claims. Implementations may call out to a model
/// service.
#[async_trait]
pub trait ProductionOracle: Send + Sync {
    async fn assess(&self, claim: &ProductionClaim) -> EngineResult<OracleAssessment>;
}

/// Plausible specific energy consumption for a production method, kWh/kg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EfficiencyRange {
    pub min: f64,
    pub max: f64,
    pub optimal: f64,
}

/// Deterministic stand-in oracle: scores a claim by how close its
/// kWh/kg figure is to the method's optimum.
#[derive(Debug, Clone)]
pub struct EfficiencyOracle {
    ranges: HashMap<String, EfficiencyRange>,
    fallback: EfficiencyRange,
}

impl Default for EfficiencyOracle {
    fn default() -> Self {
        let electrolysis = EfficiencyRange {
            min: 45.0,
            max: 60.0,
            optimal: 52.5,
        };
        let ranges = [
            ("electrolysis", electrolysis),
            (
                "wind",
                EfficiencyRange {
                    min: 40.0,
                    max: 55.0,
                    optimal: 47.5,
                },
            ),
            (
                "solar",
                EfficiencyRange {
                    min: 45.0,
                    max: 58.0,
                    optimal: 51.0,
                },
            ),
        ]
        .into_iter()
        .map(|(name, range)| (name.to_string(), range))
        .collect();
        Self {
            ranges,
            fallback: electrolysis,
        }
    }
}

impl EfficiencyOracle {
    pub fn range_for(&self, method: &str) -> EfficiencyRange {
        self.ranges
            .get(&method.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(self.fallback)
    }

    fn score(&self, claim: &ProductionClaim) -> OracleAssessment {
        let range = self.range_for(&claim.production_method);
        let efficiency = claim.kwh_per_kg();
        let span = range.max - range.min;

        let efficiency_score = if (range.min..=range.max).contains(&efficiency) {
            (1.0 - (efficiency - range.optimal).abs() / span).clamp(0.1, 1.0)
        } else {
            0.1
        };

        // Hydrogen the energy input could plausibly have produced.
        let kwh = claim.energy_mwh * 1000.0;
        let (expected_min, expected_max) = (kwh / range.max, kwh / range.min);
        let kg = claim.hydrogen_amount_kg as f64;
        let volume_score = if (expected_min..=expected_max).contains(&kg) {
            1.0
        } else {
            let deviation = (kg - expected_min).abs().min((kg - expected_max).abs());
            (1.0 - deviation / expected_min).max(0.1)
        };

        let anomaly = ((efficiency - range.optimal).abs() / range.optimal).clamp(0.0, 1.0);
        let mut fraud = anomaly * 0.4;
        if efficiency_score < 0.5 {
            fraud += 0.3;
        }
        if volume_score < 0.5 {
            fraud += 0.3;
        }

        OracleAssessment {
            validity_score: (0.5 * efficiency_score + 0.5 * volume_score).clamp(0.0, 1.0),
            fraud_probability: fraud.min(1.0),
        }
    }
}

#[async_trait]
impl ProductionOracle for EfficiencyOracle {
    async fn assess(&self, claim: &ProductionClaim) -> EngineResult<OracleAssessment> {
        Ok(self.score(claim))
    }
}

// ---------------------------------------------------------------------------
// VerificationDesk
// ---------------------------------------------------------------------------

/// Intake and bookkeeping for verification requests.
#[derive(Clone)]
pub struct VerificationDesk {
    db: CreditDb,
    oracle: Arc<dyn ProductionOracle>,
    policy: VerificationPolicy,
}

impl VerificationDesk {
    pub fn new(db: CreditDb, oracle: Arc<dyn ProductionOracle>, policy: VerificationPolicy) -> Self {
        Self { db, oracle, policy }
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    /// Scores and records a claim. Claims that miss either gate are
    /// recorded as `Rejected` straight away.
    pub async fn submit(
        &self,
        session: &Session,
        claim: ProductionClaim,
    ) -> EngineResult<VerificationRequest> {
        session.require(Role::Ngo, "submit production claims")?;
        claim.validate()?;

        let assessment = self.oracle.assess(&claim).await?;
        let passes = assessment.validity_score >= self.policy.validity_threshold
            && assessment.fraud_probability < self.policy.fraud_threshold;
        let now = Utc::now();

        let request = VerificationRequest {
            id: VerificationId(self.db.next_id(Sequence::Verification)?),
            industry_id: session.user_id,
            claim,
            validity_score: assessment.validity_score,
            fraud_probability: assessment.fraud_probability,
            status: if passes {
                VerificationStatus::Pending
            } else {
                VerificationStatus::Rejected
            },
            auditor_id: None,
            notes: (!passes).then(|| "failed automated screening".to_string()),
            credit_id: None,
            created_at: now,
            decided_at: (!passes).then_some(now),
        };
        self.db.put_verification(&request)?;
        info!(
            verification_id = %request.id,
            industry_id = %request.industry_id,
            validity = request.validity_score,
            fraud = request.fraud_probability,
            status = %request.status,
            "verification submitted"
        );
        Ok(request)
    }

    pub fn get(&self, id: VerificationId) -> EngineResult<VerificationRequest> {
        self.db
            .get_verification(id)?
            .ok_or_else(|| EngineError::NotFound {
                entity: "verification request",
                id: id.to_string(),
            })
    }

    pub fn list_pending(&self) -> EngineResult<Vec<VerificationRequest>> {
        Ok(self
            .db
            .verifications()?
            .into_iter()
            .filter(|r| r.status == VerificationStatus::Pending)
            .collect())
    }

    pub fn list_for_industry(&self, industry_id: UserId) -> EngineResult<Vec<VerificationRequest>> {
        Ok(self
            .db
            .verifications()?
            .into_iter()
            .filter(|r| r.industry_id == industry_id)
            .collect())
    }

    /// Loads a request an auditor is about to decide.
    pub(crate) fn open_for_decision(
        &self,
        session: &Session,
        id: VerificationId,
    ) -> EngineResult<VerificationRequest> {
        session.require(Role::Auditor, "decide verification requests")?;
        let request = self.get(id)?;
        if request.status != VerificationStatus::Pending {
            return Err(EngineError::InvalidState {
                subject: format!("verification request {id}"),
                current: request.status.to_string(),
                expected: VerificationStatus::Pending.to_string(),
            });
        }
        Ok(request)
    }

    pub(crate) fn record_decision(&self, request: &VerificationRequest) -> EngineResult<()> {
        self.db.put_verification(request)?;
        info!(
            verification_id = %request.id,
            status = %request.status,
            credit_id = ?request.credit_id.map(|c| c.0),
            "verification decided"
        );
        Ok(())
    }
}

impl fmt::Debug for VerificationDesk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationDesk")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
