//! End-to-end tests for the credit lifecycle.
//!
//! Each test builds its own engine over a temporary sled database and an
//! in-memory ledger, then drives credits through creation, audit, trading
//! and expiry using only the public API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use h2credit_protocol::certificate::CertificateRegistry;
use h2credit_protocol::config::{CredentialPolicy, EngineConfig, RetryPolicy};
use h2credit_protocol::credit::{Credit, CreditDraft, RequestStatus, Verdict, Vote};
use h2credit_protocol::engine::CreditEngine;
use h2credit_protocol::error::ErrorKind;
use h2credit_protocol::identity::{Role, Session, UserId};
use h2credit_protocol::ledger::{
    Fault, InMemoryLedger, LedgerClient, LedgerCredit, LedgerError, LedgerOp, Receipt,
};
use h2credit_protocol::storage::CreditDb;
use h2credit_protocol::verification::{EfficiencyOracle, ProductionClaim, VerificationStatus};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const SECRET: &str = "hunter2-but-longer";

struct World {
    engine: Arc<CreditEngine>,
    ledger: Arc<InMemoryLedger>,
    ngo: Session,
    alice: Session,
    bob: Session,
    auditors: Vec<Session>,
}

fn setup(auditors: usize) -> World {
    let ledger = Arc::new(InMemoryLedger::new());
    setup_over(auditors, ledger.clone(), ledger)
}

/// Builds a world whose engine talks to `client`; `ledger` is the state
/// behind it.
fn setup_over(auditors: usize, ledger: Arc<InMemoryLedger>, client: Arc<dyn LedgerClient>) -> World {
    let config = EngineConfig {
        ledger_retry: RetryPolicy::immediate(2),
        credentials: CredentialPolicy::minimal(),
        ..EngineConfig::default()
    };
    let engine = CreditEngine::new(
        CreditDb::open_temporary().expect("temp db"),
        client,
        Arc::new(EfficiencyOracle::default()),
        config,
    )
    .expect("engine");

    let accounts = engine.accounts();
    let ngo = accounts.register("solar-coop", SECRET, Role::Ngo).unwrap().session();
    let alice = accounts.register("alice", SECRET, Role::Buyer).unwrap().session();
    let bob = accounts.register("bob", SECRET, Role::Buyer).unwrap().session();
    let auditors = (0..auditors)
        .map(|i| {
            accounts
                .register(&format!("auditor-{i}"), SECRET, Role::Auditor)
                .unwrap()
                .session()
        })
        .collect();

    World {
        engine: Arc::new(engine),
        ledger,
        ngo,
        alice,
        bob,
        auditors,
    }
}

fn draft(name: &str, amount_kg: u64) -> CreditDraft {
    CreditDraft {
        name: name.into(),
        amount_kg,
        price_gwei: 40_000,
        document_url: "https://example.org/proof.pdf".into(),
    }
}

/// The sessions of the auditors assigned to `credit`, in id order.
fn assigned(world: &World, credit: &Credit) -> Vec<Session> {
    credit
        .auditors_assigned
        .iter()
        .map(|id| {
            world
                .auditors
                .iter()
                .find(|s| s.user_id == *id)
                .cloned()
                .expect("assigned auditor is registered")
        })
        .collect()
}

/// Delegates to an in-memory ledger but holds `buy_credit` for `delay`
/// before forwarding it.
struct SlowLedger {
    inner: Arc<InMemoryLedger>,
    delay: Duration,
}

#[async_trait]
impl LedgerClient for SlowLedger {
    async fn generate_credit(&self, caller: UserId, amount_kg: u64, price_gwei: u64) -> Result<Receipt, LedgerError> {
        self.inner.generate_credit(caller, amount_kg, price_gwei).await
    }

    async fn sell_credit(&self, caller: UserId, credit_id: u64, price_gwei: u64) -> Result<Receipt, LedgerError> {
        self.inner.sell_credit(caller, credit_id, price_gwei).await
    }

    async fn buy_credit(&self, caller: UserId, credit_id: u64, value_gwei: u64) -> Result<Receipt, LedgerError> {
        tokio::time::sleep(self.delay).await;
        self.inner.buy_credit(caller, credit_id, value_gwei).await
    }

    async fn remove_from_sale(&self, caller: UserId, credit_id: u64) -> Result<Receipt, LedgerError> {
        self.inner.remove_from_sale(caller, credit_id).await
    }

    async fn expire(&self, caller: UserId, credit_id: u64) -> Result<Receipt, LedgerError> {
        self.inner.expire(caller, credit_id).await
    }

    async fn request_audit(
        &self,
        caller: UserId,
        credit_id: u64,
        fee_gwei: u64,
        auditors: Vec<UserId>,
    ) -> Result<Receipt, LedgerError> {
        self.inner.request_audit(caller, credit_id, fee_gwei, auditors).await
    }

    async fn audit_credit(&self, caller: UserId, credit_id: u64, vote: Vote) -> Result<Receipt, LedgerError> {
        self.inner.audit_credit(caller, credit_id, vote).await
    }

    async fn credit(&self, credit_id: u64) -> Result<Option<LedgerCredit>, LedgerError> {
        self.inner.credit(credit_id).await
    }

    async fn price(&self, credit_id: u64) -> Result<u64, LedgerError> {
        self.inner.price(credit_id).await
    }

    async fn auditor_list(&self, credit_id: u64) -> Result<Vec<UserId>, LedgerError> {
        self.inner.auditor_list(credit_id).await
    }
}

// ---------------------------------------------------------------------------
// 1. Full Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_credit_lifecycle() {
    let w = setup(5);

    // Creation opens a three-auditor audit on the ledger.
    let credit = w
        .engine
        .create_credit(&w.ngo, draft("Rotterdam electrolyser Q1", 250))
        .await
        .unwrap();
    assert_eq!(credit.request_status, RequestStatus::Pending);
    assert_eq!(credit.auditors_assigned.len(), 3);
    let queued: usize = w
        .auditors
        .iter()
        .map(|a| w.engine.projector().list_assigned(a.user_id).unwrap().len())
        .sum();
    assert_eq!(queued, 3);

    // Two accepts and a reject: score 1, accepted on the last ballot only.
    let panel = assigned(&w, &credit);
    let first = w.engine.cast_vote(&panel[0], credit.id, true).await.unwrap();
    assert_eq!(first.decision, None);
    let second = w.engine.cast_vote(&panel[1], credit.id, true).await.unwrap();
    assert_eq!(second.decision, None);
    assert_eq!(second.votes_remaining, 1);
    let last = w.engine.cast_vote(&panel[2], credit.id, false).await.unwrap();
    assert_eq!(last.decision, Some(Verdict::Accepted));
    assert_eq!(last.audit_score, 1);

    // List, buy, resell.
    w.engine.put_for_sale(&w.ngo, credit.id, 50_000).await.unwrap();
    assert_eq!(w.engine.projector().list_available().unwrap().len(), 1);

    let first_sale = w.engine.purchase(&w.alice, credit.id).await.unwrap();
    assert_eq!(first_sale.transaction.seller_id, w.ngo.user_id);
    assert!(w.engine.projector().list_available().unwrap().is_empty());

    w.engine.put_for_sale(&w.alice, credit.id, 65_000).await.unwrap();
    let analytics = w.engine.projector().portfolio_analytics(w.alice.user_id).unwrap();
    assert_eq!(analytics.total_invested_gwei, 50_000);
    assert_eq!(analytics.current_value_gwei, 65_000);
    assert_eq!(analytics.profit_loss_gwei, 15_000);
    assert_eq!(analytics.profit_loss_percentage, 30.0);

    let second_sale = w.engine.purchase(&w.bob, credit.id).await.unwrap();
    assert_eq!(second_sale.transaction.seller_id, w.alice.user_id);
    assert_eq!(w.engine.projector().list_purchased(w.bob.user_id).unwrap().len(), 1);
    assert!(w.engine.projector().list_purchased(w.alice.user_id).unwrap().is_empty());

    // The creator retires the credit while bob holds it.
    let expiry = w
        .engine
        .expire(&w.ngo, credit.id, "Rotterdam electrolyser Q1", SECRET)
        .await
        .unwrap();
    assert_eq!(expiry.credit.state_label(), "Expired");
    assert_eq!(expiry.certificate.holder_id, w.bob.user_id);
    assert_eq!(expiry.certificate.audit_score, 1);

    // Every involved party reads the same bytes.
    let for_bob = w.engine.certificate(&w.bob, credit.id).await.unwrap();
    let for_alice = w.engine.certificate(&w.alice, credit.id).await.unwrap();
    let for_ngo = w.engine.certificate(&w.ngo, credit.id).await.unwrap();
    assert_eq!(for_bob, for_alice);
    assert_eq!(for_bob, for_ngo);
    assert!(CertificateRegistry::decode(&for_bob).unwrap().is_intact());

    // Nothing moves after expiry.
    let err = w.engine.put_for_sale(&w.bob, credit.id, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let stored = w.engine.credit(credit.id).await.unwrap();
    assert!(stored.invariants_hold());
    assert_eq!(w.engine.projector().transactions().unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// 2. Rejected Audit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn negative_audit_rejects_and_locks_the_credit() {
    let w = setup(3);
    let credit = w.engine.create_credit(&w.ngo, draft("Doubtful", 10)).await.unwrap();
    let panel = assigned(&w, &credit);
    w.engine.cast_vote(&panel[0], credit.id, true).await.unwrap();
    w.engine.cast_vote(&panel[1], credit.id, false).await.unwrap();
    // Score 0 after two ballots; the third decides it.
    let last = w.engine.cast_vote(&panel[2], credit.id, false).await.unwrap();
    assert_eq!(last.decision, Some(Verdict::Rejected));

    let err = w.engine.put_for_sale(&w.ngo, credit.id, 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = w.engine.expire(&w.ngo, credit.id, "Doubtful", SECRET).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

// ---------------------------------------------------------------------------
// 3. Concurrent Ballots
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_final_ballots_decide_once() {
    let w = setup(3);
    let credit = w.engine.create_credit(&w.ngo, draft("Race", 10)).await.unwrap();
    let panel = assigned(&w, &credit);
    w.engine.cast_vote(&panel[0], credit.id, true).await.unwrap();

    let spawn_vote = |session: Session| {
        let engine = w.engine.clone();
        tokio::spawn(async move { engine.cast_vote(&session, credit.id, true).await })
    };
    let a = spawn_vote(panel[1].clone());
    let b = spawn_vote(panel[2].clone());
    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

    let decisions = outcomes.iter().filter(|o| o.decision.is_some()).count();
    assert_eq!(decisions, 1);
    let stored = w.engine.store().get_credit(credit.id).unwrap();
    assert_eq!(stored.audit_score, 3);
    assert_eq!(stored.request_status, RequestStatus::Decided(Verdict::Accepted));
    assert_eq!(w.ledger.call_count(LedgerOp::AuditCredit), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_final_ballot_sees_a_decided_credit() {
    let w = setup(3);
    let credit = w.engine.create_credit(&w.ngo, draft("Replay", 10)).await.unwrap();
    let panel = assigned(&w, &credit);
    w.engine.cast_vote(&panel[0], credit.id, true).await.unwrap();
    w.engine.cast_vote(&panel[1], credit.id, true).await.unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = w.engine.clone();
            let session = panel[2].clone();
            tokio::spawn(async move { engine.cast_vote(&session, credit.id, false).await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    let mut decided = 0;
    let mut refused = 0;
    for result in results {
        match result.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.decision, Some(Verdict::Accepted));
                decided += 1;
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::InvalidState);
                refused += 1;
            }
        }
    }
    assert_eq!((decided, refused), (1, 1));
    assert_eq!(w.engine.store().get_credit(credit.id).unwrap().audit_score, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_of_two_racing_buyers_wins() {
    let w = setup(3);
    let credit = w.engine.create_credit(&w.ngo, draft("Contested", 10)).await.unwrap();
    for auditor in assigned(&w, &credit) {
        w.engine.cast_vote(&auditor, credit.id, true).await.unwrap();
    }
    w.engine.put_for_sale(&w.ngo, credit.id, 7_000).await.unwrap();

    let race = |buyer: Session| {
        let engine = w.engine.clone();
        tokio::spawn(async move { engine.purchase(&buyer, credit.id).await })
    };
    let (a, b) = tokio::join!(race(w.alice.clone()), race(w.bob.clone()));
    let results = [a.unwrap(), b.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::InvalidState);
    assert_eq!(w.engine.projector().transactions().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// 4. Ledger Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ledger_outage_is_healed_by_reconciliation() {
    let w = setup(3);
    let credit = w.engine.create_credit(&w.ngo, draft("Outage", 10)).await.unwrap();
    for auditor in assigned(&w, &credit) {
        w.engine.cast_vote(&auditor, credit.id, true).await.unwrap();
    }

    // The listing never lands: both attempts time out.
    w.ledger.fail_next(LedgerOp::SellCredit, Fault::Unavailable, 2);
    let err = w.engine.put_for_sale(&w.ngo, credit.id, 9_000).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LedgerUnavailable);
    assert!(w.engine.store().get_credit(credit.id).unwrap().reconciliation_needed);

    // The next transition first repairs the record, then proceeds.
    let listed = w.engine.put_for_sale(&w.ngo, credit.id, 9_000).await.unwrap();
    assert!(!listed.reconciliation_needed);
    assert_eq!(listed.request_status, RequestStatus::ForSale);
    assert!(w.ledger.snapshot(listed.ledger_id).unwrap().for_sale);
}

#[tokio::test(start_paused = true)]
async fn abandoned_purchase_is_reconciled_to_the_ledger() {
    let ledger = Arc::new(InMemoryLedger::new());
    let slow = Arc::new(SlowLedger {
        inner: ledger.clone(),
        delay: Duration::from_millis(500),
    });
    let w = setup_over(3, ledger, slow);
    let credit = w.engine.create_credit(&w.ngo, draft("Dropped", 10)).await.unwrap();
    for auditor in assigned(&w, &credit) {
        w.engine.cast_vote(&auditor, credit.id, true).await.unwrap();
    }
    w.engine.put_for_sale(&w.ngo, credit.id, 9_000).await.unwrap();

    // The caller gives up while the ledger call is still pending.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        w.engine.purchase(&w.alice, credit.id),
    )
    .await;
    assert!(abandoned.is_err());

    let stored = w.engine.store().get_credit(credit.id).unwrap();
    assert!(stored.reconciliation_needed);
    assert_eq!(w.ledger.snapshot(stored.ledger_id).unwrap().owner, w.ngo.user_id);

    // The next read adopts the ledger's view: the NGO still owns the listing.
    let healed = w.engine.credit(credit.id).await.unwrap();
    assert!(!healed.reconciliation_needed);
    assert_eq!(healed.owner_id, w.ngo.user_id);
    assert_eq!(healed.request_status, RequestStatus::ForSale);
    assert!(w.engine.projector().transactions().unwrap().is_empty());

    // And the credit can still be bought for real.
    let bought = w.engine.purchase(&w.alice, credit.id).await.unwrap();
    assert_eq!(bought.credit.owner_id, w.alice.user_id);
    assert_eq!(w.ledger.snapshot(stored.ledger_id).unwrap().owner, w.alice.user_id);
}

// ---------------------------------------------------------------------------
// 5. Production Verification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verified_production_becomes_an_audited_credit() {
    let w = setup(3);

    let implausible = ProductionClaim {
        production_method: "electrolysis".into(),
        hydrogen_amount_kg: 100,
        energy_mwh: 0.5,
    };
    let rejected = w
        .engine
        .submit_verification(&w.ngo, implausible)
        .await
        .unwrap();
    assert_eq!(rejected.status, VerificationStatus::Rejected);

    let plausible = ProductionClaim {
        production_method: "electrolysis".into(),
        hydrogen_amount_kg: 100,
        energy_mwh: 5.25,
    };
    let request = w.engine.submit_verification(&w.ngo, plausible).await.unwrap();
    assert_eq!(request.status, VerificationStatus::Pending);
    assert_eq!(w.engine.verification().list_for_industry(w.ngo.user_id).unwrap().len(), 2);

    let err = w
        .engine
        .approve_verification(&w.alice, request.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let approved = w
        .engine
        .approve_verification(&w.auditors[0], request.id)
        .await
        .unwrap();
    let credit = w.engine.credit(approved.credit_id.unwrap()).await.unwrap();
    assert_eq!(credit.creator_id, w.ngo.user_id);
    assert_eq!(credit.request_status, RequestStatus::Pending);
    assert_eq!(w.engine.projector().list_by_creator(w.ngo.user_id).unwrap().len(), 1);
}
