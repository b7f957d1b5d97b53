//! # Prometheus Metrics
//!
//! Business and request metrics for the node, scraped at `/metrics` on the
//! metrics port. Everything lives in a dedicated [`prometheus::Registry`]
//! under the `h2credit` namespace.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use h2credit_protocol::credit::Verdict;
use h2credit_protocol::error::{EngineError, ErrorKind};

/// Metric handles shared by request handlers.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub credits_created_total: IntCounter,
    pub votes_cast_total: IntCounter,
    /// Labelled by `verdict` (`accepted` / `rejected`).
    pub quorum_decisions_total: IntCounterVec,
    pub purchases_total: IntCounter,
    pub expirations_total: IntCounter,
    /// Labelled by `kind` (`rejected` / `unavailable`).
    pub ledger_failures_total: IntCounterVec,
    pub request_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("h2credit".into()), None)?;

        let credits_created_total =
            IntCounter::new("credits_created_total", "Credits issued and sent to audit")?;
        registry.register(Box::new(credits_created_total.clone()))?;

        let votes_cast_total = IntCounter::new("votes_cast_total", "Auditor ballots recorded")?;
        registry.register(Box::new(votes_cast_total.clone()))?;

        let quorum_decisions_total = IntCounterVec::new(
            Opts::new("quorum_decisions_total", "Audits decided by a full quorum"),
            &["verdict"],
        )?;
        registry.register(Box::new(quorum_decisions_total.clone()))?;

        let purchases_total = IntCounter::new("purchases_total", "Completed credit purchases")?;
        registry.register(Box::new(purchases_total.clone()))?;

        let expirations_total = IntCounter::new("expirations_total", "Credits retired")?;
        registry.register(Box::new(expirations_total.clone()))?;

        let ledger_failures_total = IntCounterVec::new(
            Opts::new(
                "ledger_failures_total",
                "Transitions that failed because of the ledger",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(ledger_failures_total.clone()))?;

        let request_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("request_latency_seconds", "API request latency in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;
        registry.register(Box::new(request_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            credits_created_total,
            votes_cast_total,
            quorum_decisions_total,
            purchases_total,
            expirations_total,
            ledger_failures_total,
            request_latency_seconds,
        })
    }

    pub fn record_decision(&self, verdict: Verdict) {
        let label = match verdict {
            Verdict::Accepted => "accepted",
            Verdict::Rejected => "rejected",
        };
        self.quorum_decisions_total.with_label_values(&[label]).inc();
    }

    /// Counts `err` if the ledger caused it.
    pub fn record_failure(&self, err: &EngineError) {
        let label = match err.kind() {
            ErrorKind::LedgerRejected => "rejected",
            ErrorKind::LedgerUnavailable => "unavailable",
            _ => return,
        };
        self.ledger_failures_total.with_label_values(&[label]).inc();
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
