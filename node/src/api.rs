//! # REST API
//!
//! Builds the axum router for the marketplace. Handlers resolve the caller's
//! [`Session`] from a bearer token, call into the [`CreditEngine`], and map
//! engine errors to HTTP status codes in one place ([`ApiError`]).
//!
//! ## Endpoints
//!
//! | Method | Path                              | Role    | Description                        |
//! |--------|-----------------------------------|---------|------------------------------------|
//! | GET    | `/health`                         | -       | Liveness check                     |
//! | POST   | `/auth/signup`                    | -       | Register and open a session        |
//! | POST   | `/auth/login`                     | -       | Open a session                     |
//! | POST   | `/auth/logout`                    | any     | Close the caller's session         |
//! | GET    | `/NGO/credits`                    | NGO     | Dashboard of issued credits        |
//! | POST   | `/NGO/credits`                    | NGO     | Issue a credit and open its audit  |
//! | PATCH  | `/NGO/credits/expire/:id`         | NGO     | Retire a credit                    |
//! | POST   | `/NGO/expire-req`                 | NGO     | Re-confirm identity before expiry  |
//! | GET    | `/NGO/audit-req?amount=&price=`   | NGO     | Auditor requirement and fee        |
//! | GET    | `/NGO/transactions`               | NGO     | Trade log, newest first            |
//! | GET    | `/auditor/credits`                | auditor | Credits awaiting the caller's vote |
//! | PATCH  | `/auditor/audit/:id`              | auditor | Cast a ballot                      |
//! | GET    | `/buyer/credits`                  | buyer   | Credits for sale                   |
//! | POST   | `/buyer/purchase`                 | buyer   | Buy a listed credit                |
//! | PATCH  | `/buyer/sell`                     | owner   | List an owned credit               |
//! | PATCH  | `/buyer/remove-from-sale`         | owner   | Withdraw a listing                 |
//! | GET    | `/buyer/purchased`                | buyer   | Credits held through a purchase    |
//! | GET    | `/buyer/portfolio-analytics`      | buyer   | Portfolio totals                   |
//! | GET    | `/buyer/certificate/:id`          | any     | Retirement certificate bytes       |
//! | GET    | `/credits/:id`                    | any     | One credit                         |
//! | POST   | `/verification/submit`            | NGO     | Submit a production claim          |
//! | GET    | `/verification/pending`           | auditor | Claims awaiting a decision         |
//! | POST   | `/verification/:id/approve`       | auditor | Approve and issue a credit         |
//! | POST   | `/verification/:id/reject`        | auditor | Reject with notes                  |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use h2credit_protocol::config::GWEI_PER_ETH;
use h2credit_protocol::credit::{CreditDraft, CreditId};
use h2credit_protocol::engine::CreditEngine;
use h2credit_protocol::error::{EngineError, EngineResult, ErrorKind};
use h2credit_protocol::identity::{Role, Session, UserId};
use h2credit_protocol::projector::PortfolioAnalytics;
use h2credit_protocol::verification::{ProductionClaim, VerificationId};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub engine: Arc<CreditEngine>,
    pub sessions: Arc<SessionTable>,
    pub metrics: SharedMetrics,
}

impl AppState {
    /// Converts an engine result, counting ledger failures on the way.
    fn observe<T>(&self, result: EngineResult<T>) -> ApiResult<T> {
        result.map_err(|e| {
            self.metrics.record_failure(&e);
            ApiError::from(e)
        })
    }
}

/// How long a session token stays valid unless configured otherwise.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug)]
struct OpenSession {
    session: Session,
    expires_at: Instant,
}

/// Bearer tokens of open sessions. A token lives until it is revoked or its
/// time to live runs out; expired tokens are dropped when next seen and
/// swept whenever a new session opens.
#[derive(Debug)]
pub struct SessionTable {
    ttl: Duration,
    tokens: RwLock<HashMap<String, OpenSession>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a session and returns its token.
    pub fn issue(&self, session: Session) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        let mut tokens = self.tokens.write();
        tokens.retain(|_, open| open.expires_at > now);
        tokens.insert(
            token.clone(),
            OpenSession {
                session,
                expires_at: now + self.ttl,
            },
        );
        token
    }

    pub fn resolve(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        match self.tokens.read().get(token) {
            Some(open) if open.expires_at > now => return Some(open.session.clone()),
            Some(_) => {}
            None => return None,
        }
        self.tokens.write().remove(token);
        None
    }

    /// Closes a session. Returns whether the token was open.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP status and wire label for each failure class.
fn classify(kind: ErrorKind) -> (StatusCode, &'static str) {
    match kind {
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation"),
        ErrorKind::Unauthorized => (StatusCode::FORBIDDEN, "unauthorized"),
        ErrorKind::Authentication => (StatusCode::UNAUTHORIZED, "authentication"),
        ErrorKind::DuplicateVote => (StatusCode::CONFLICT, "duplicate_vote"),
        ErrorKind::InvalidState => (StatusCode::CONFLICT, "invalid_state"),
        ErrorKind::ConfirmationMismatch => (StatusCode::CONFLICT, "confirmation_mismatch"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ErrorKind::LedgerRejected => (StatusCode::UNPROCESSABLE_ENTITY, "ledger_rejected"),
        ErrorKind::LedgerUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable"),
        ErrorKind::InsufficientAuditors => {
            (StatusCode::SERVICE_UNAVAILABLE, "insufficient_auditors")
        }
        ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>) -> Self {
        let (status, kind) = classify(ErrorKind::Authentication);
        Self {
            status,
            kind,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let (status, kind) = classify(err.kind());
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            kind: self.kind.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The caller's session, resolved from `Authorization: Bearer <token>`.
pub struct AuthSession(pub Session);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        state
            .sessions
            .resolve(token)
            .map(AuthSession)
            .ok_or_else(|| ApiError::unauthenticated("unknown session token"))
    }
}

fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthenticated("missing bearer token"))
}

/// Gate for the role-specific route groups.
fn require_role(session: &Session, role: Role) -> ApiResult<()> {
    let action = match role {
        Role::Ngo => "use the NGO dashboard",
        Role::Buyer => "use the buyer dashboard",
        Role::Auditor => "use the auditor dashboard",
    };
    session.require(role, action).map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
    /// `NGO`, `buyer` or `auditor`, any case.
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct CreateCreditRequest {
    pub name: String,
    pub amount: u64,
    /// Listing price in gwei.
    pub price: u64,
    #[serde(default)]
    pub document_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ExpireRequest {
    pub credit_name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct IdentityRequest {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub amount: u64,
    pub price: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditRequirement {
    pub amount_kg: u64,
    pub required: usize,
    pub available: usize,
    /// Only reported when a price was given.
    pub fee_gwei: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    /// `true` to accept, `false` to reject.
    pub vote: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreditRef {
    pub credit_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct SellRequest {
    pub credit_id: u64,
    pub price: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortfolioResponse {
    #[serde(flatten)]
    pub analytics: PortfolioAnalytics,
    pub total_invested_eth: f64,
    pub current_value_eth: f64,
}

fn gwei_to_eth(gwei: u64) -> f64 {
    gwei as f64 / GWEI_PER_ETH as f64
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the API router with CORS, request tracing and latency metrics.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/signup", post(signup_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/NGO/credits", get(ngo_credits_handler).post(create_credit_handler))
        .route("/NGO/credits/expire/:id", patch(expire_handler))
        .route("/NGO/expire-req", post(expire_request_handler))
        .route("/NGO/audit-req", get(audit_requirement_handler))
        .route("/NGO/transactions", get(ngo_transactions_handler))
        .route("/auditor/credits", get(auditor_credits_handler))
        .route("/auditor/audit/:id", patch(vote_handler))
        .route("/buyer/credits", get(marketplace_handler))
        .route("/buyer/purchase", post(purchase_handler))
        .route("/buyer/sell", patch(sell_handler))
        .route("/buyer/remove-from-sale", patch(remove_from_sale_handler))
        .route("/buyer/purchased", get(purchased_handler))
        .route("/buyer/portfolio-analytics", get(portfolio_handler))
        .route("/buyer/certificate/:id", get(certificate_handler))
        .route("/credits/:id", get(credit_handler))
        .route("/verification/submit", post(submit_verification_handler))
        .route("/verification/pending", get(pending_verifications_handler))
        .route("/verification/:id/approve", post(approve_verification_handler))
        .route("/verification/:id/reject", post(reject_verification_handler))
        .layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            track_latency,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_latency(State(metrics): State<SharedMetrics>, request: Request, next: Next) -> Response {
    let timer = metrics.request_latency_seconds.start_timer();
    let response = next.run(request).await;
    timer.observe_duration();
    response
}

// ---------------------------------------------------------------------------
// Handlers: health and auth
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": state.version }))
}

/// `POST /auth/signup`
async fn signup_handler(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let role: Role = req.role.parse()?;
    let account = state
        .engine
        .accounts()
        .register(&req.username, &req.password, role)?;
    let session = account.session();
    tracing::info!(user_id = %session.user_id, role = %session.role, "account registered");
    Ok((StatusCode::CREATED, Json(open_session(&state, session))))
}

/// `POST /auth/login`
async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let session = state
        .engine
        .accounts()
        .authenticate(&req.username, &req.password)?;
    Ok(Json(open_session(&state, session)))
}

/// `POST /auth/logout`
async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    if state.sessions.revoke(bearer_token(&headers)?) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::unauthenticated("unknown session token"))
    }
}

fn open_session(state: &AppState, session: Session) -> AuthResponse {
    let token = state.sessions.issue(session.clone());
    AuthResponse {
        token,
        user_id: session.user_id,
        username: session.username,
        role: session.role,
    }
}

// ---------------------------------------------------------------------------
// Handlers: NGO
// ---------------------------------------------------------------------------

/// `GET /NGO/credits`
async fn ngo_credits_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Ngo)?;
    let rows = state.engine.projector().list_by_creator(session.user_id)?;
    Ok(Json(rows))
}

/// `POST /NGO/credits`
async fn create_credit_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(req): Json<CreateCreditRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Ngo)?;
    let draft = CreditDraft {
        name: req.name,
        amount_kg: req.amount,
        price_gwei: req.price,
        document_url: req.document_url,
    };
    let credit = state.observe(state.engine.create_credit(&session, draft).await)?;
    state.metrics.credits_created_total.inc();
    Ok((StatusCode::CREATED, Json(credit)))
}

/// `PATCH /NGO/credits/expire/:id`
async fn expire_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Path(id): Path<u64>,
    Json(req): Json<ExpireRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Ngo)?;
    let expiry = state.observe(
        state
            .engine
            .expire(&session, CreditId(id), &req.credit_name, &req.password)
            .await,
    )?;
    state.metrics.expirations_total.inc();
    Ok(Json(expiry))
}

/// `POST /NGO/expire-req`
async fn expire_request_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(req): Json<IdentityRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Ngo)?;
    state.engine.verify_identity(&session, &req.password)?;
    Ok(Json(serde_json::json!({ "verified": true })))
}

/// `GET /NGO/audit-req?amount=&price=`
async fn audit_requirement_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Query(query): Query<AuditQuery>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Ngo)?;
    let capacity = state.engine.check_audit_capacity(query.amount)?;
    Ok(Json(AuditRequirement {
        amount_kg: capacity.amount_kg,
        required: capacity.required,
        available: capacity.available,
        fee_gwei: query
            .price
            .map(|price| state.engine.audit_fee(query.amount, price)),
    }))
}

/// `GET /NGO/transactions`
async fn ngo_transactions_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Ngo)?;
    Ok(Json(state.engine.projector().transactions()?))
}

// ---------------------------------------------------------------------------
// Handlers: auditor
// ---------------------------------------------------------------------------

/// `GET /auditor/credits`
async fn auditor_credits_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Auditor)?;
    Ok(Json(state.engine.projector().list_assigned(session.user_id)?))
}

/// `PATCH /auditor/audit/:id`
async fn vote_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Path(id): Path<u64>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Auditor)?;
    let outcome = state.observe(state.engine.cast_vote(&session, CreditId(id), req.vote).await)?;
    state.metrics.votes_cast_total.inc();
    if let Some(verdict) = outcome.decision {
        state.metrics.record_decision(verdict);
    }
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Handlers: buyer and trading
// ---------------------------------------------------------------------------

/// `GET /buyer/credits`
async fn marketplace_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Buyer)?;
    Ok(Json(state.engine.projector().list_available()?))
}

/// `POST /buyer/purchase`
async fn purchase_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(req): Json<CreditRef>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Buyer)?;
    let purchase = state.observe(state.engine.purchase(&session, CreditId(req.credit_id)).await)?;
    state.metrics.purchases_total.inc();
    Ok(Json(purchase))
}

/// `PATCH /buyer/sell`. Open to any owner: NGOs make the first listing
/// through here as well.
async fn sell_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(req): Json<SellRequest>,
) -> ApiResult<impl IntoResponse> {
    let credit = state.observe(
        state
            .engine
            .put_for_sale(&session, CreditId(req.credit_id), req.price)
            .await,
    )?;
    Ok(Json(credit))
}

/// `PATCH /buyer/remove-from-sale`
async fn remove_from_sale_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(req): Json<CreditRef>,
) -> ApiResult<impl IntoResponse> {
    let credit = state.observe(
        state
            .engine
            .remove_from_sale(&session, CreditId(req.credit_id))
            .await,
    )?;
    Ok(Json(credit))
}

/// `GET /buyer/purchased`
async fn purchased_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Buyer)?;
    Ok(Json(state.engine.projector().list_purchased(session.user_id)?))
}

/// `GET /buyer/portfolio-analytics`
async fn portfolio_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Buyer)?;
    let analytics = state.engine.projector().portfolio_analytics(session.user_id)?;
    Ok(Json(PortfolioResponse {
        total_invested_eth: gwei_to_eth(analytics.total_invested_gwei),
        current_value_eth: gwei_to_eth(analytics.current_value_gwei),
        analytics,
    }))
}

/// `GET /buyer/certificate/:id`. Returns the stored bytes untouched.
async fn certificate_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let bytes = state.observe(state.engine.certificate(&session, CreditId(id)).await)?;
    let disposition = format!("attachment; filename=\"h2credit-certificate-{id}.json\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// `GET /credits/:id`
async fn credit_handler(
    State(state): State<AppState>,
    AuthSession(_session): AuthSession,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let credit = state.observe(state.engine.credit(CreditId(id)).await)?;
    Ok(Json(credit))
}

// ---------------------------------------------------------------------------
// Handlers: production verification
// ---------------------------------------------------------------------------

/// `POST /verification/submit`
async fn submit_verification_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(claim): Json<ProductionClaim>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Ngo)?;
    let request = state.engine.submit_verification(&session, claim).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// `GET /verification/pending`
async fn pending_verifications_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Auditor)?;
    Ok(Json(state.engine.verification().list_pending()?))
}

/// `POST /verification/:id/approve`
async fn approve_verification_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Auditor)?;
    let request = state.observe(
        state
            .engine
            .approve_verification(&session, VerificationId(id))
            .await,
    )?;
    state.metrics.credits_created_total.inc();
    Ok(Json(request))
}

/// `POST /verification/:id/reject`
async fn reject_verification_handler(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Path(id): Path<u64>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&session, Role::Auditor)?;
    let request = state
        .engine
        .reject_verification(&session, VerificationId(id), req.notes)
        .await?;
    Ok(Json(request))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
