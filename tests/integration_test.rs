//! Integration tests for the bridge settlement engine
//!
//! Run with: cargo test --test integration_test -- --ignored --nocapture
//!
//! Prerequisites:
//! - Postgres running locally
//! - DATABASE_URL set (migrations are applied automatically)
//!
//! Every test creates its own users, chains, and burn hashes, so the suite
//! can run repeatedly against the same database.

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use sqlx::PgPool;

use semilla_bridge::blacklist::BlacklistEnforcer;
use semilla_bridge::breaker::CircuitBreaker;
use semilla_bridge::config::{AdapterConfig, PolicyConfig, SecurityConfig};
use semilla_bridge::db;
use semilla_bridge::monitor::{EventDetails, SecurityMonitor};
use semilla_bridge::orchestrator::{BridgeOrchestrator, LockRequest, UnlockRequest};
use semilla_bridge::registry::{ChainRegistry, SupportedChain};
use semilla_bridge::testing::MockChainAdapter;
use semilla_bridge::types::{EntryType, TxStatus};

mod helpers {
    use super::*;

    /// A fully wired engine with a scriptable chain adapter
    pub struct Engine {
        pub pool: PgPool,
        pub chain: SupportedChain,
        pub breaker: Arc<CircuitBreaker>,
        pub monitor: Arc<SecurityMonitor>,
        pub blacklist: Arc<BlacklistEnforcer>,
        pub adapter: Arc<MockChainAdapter>,
        pub orchestrator: BridgeOrchestrator,
    }

    /// Unique suffix so tests are re-runnable against the same database
    pub fn unique(prefix: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        format!("{prefix}{:x}", nanos & 0xffff_ffff_ffff)
    }

    pub async fn connect() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = db::create_pool(&url, 5).await.ok()?;
        db::run_migrations(&pool).await.ok()?;
        Some(pool)
    }

    /// Register a fresh chain and wire an engine around it
    pub async fn engine(pool: PgPool, min_amount: &str, fee: &str) -> Engine {
        engine_with_security(pool, min_amount, fee, test_security_config()).await
    }

    pub fn test_security_config() -> SecurityConfig {
        SecurityConfig {
            critical_trip_threshold: 3,
            trip_window_secs: 3600,
            repeated_unlock_threshold: 3,
        }
    }

    pub async fn engine_with_security(
        pool: PgPool,
        min_amount: &str,
        fee: &str,
        security: SecurityConfig,
    ) -> Engine {
        let chain_code = unique("T");
        db::upsert_chain(&pool, &chain_code, "Test chain", min_amount, fee)
            .await
            .expect("chain upsert");

        let chain = SupportedChain {
            chain_code: chain_code.clone(),
            display_name: "Test chain".to_string(),
            min_amount: BigDecimal::from_str(min_amount).unwrap(),
            fee: BigDecimal::from_str(fee).unwrap(),
        };
        let registry = Arc::new(ChainRegistry::from_chains(vec![chain.clone()]).unwrap());

        let breaker = Arc::new(CircuitBreaker::new());
        let monitor = Arc::new(SecurityMonitor::new(
            pool.clone(),
            breaker.clone(),
            security,
        ));
        let blacklist = Arc::new(
            BlacklistEnforcer::load(pool.clone())
                .await
                .expect("blacklist load"),
        );
        let adapter = Arc::new(MockChainAdapter::new());

        let orchestrator = BridgeOrchestrator::new(
            pool.clone(),
            registry,
            blacklist.clone(),
            breaker.clone(),
            monitor.clone(),
            adapter.clone(),
            AdapterConfig {
                base_url: "http://gateway.invalid".to_string(),
                timeout_secs: 5,
            },
            PolicyConfig {
                storage_retry_attempts: 3,
                refund_retry_attempts: 3,
                stale_after_secs: 900,
                stale_check_interval_secs: 60,
            },
        );

        Engine {
            pool,
            chain,
            breaker,
            monitor,
            blacklist,
            adapter,
            orchestrator,
        }
    }

    pub async fn fund(pool: &PgPool, user_id: &str, amount: &str) {
        db::credit_balance(pool, user_id, amount)
            .await
            .expect("funding balance");
    }

    pub async fn balance_of(pool: &PgPool, user_id: &str) -> BigDecimal {
        db::get_balance(pool, user_id)
            .await
            .expect("balance query")
            .map(|raw| BigDecimal::from_str(&raw).expect("valid balance"))
            .unwrap_or_else(|| BigDecimal::from(0))
    }

    pub fn lock_request(engine: &Engine, user_id: &str, amount: &str) -> LockRequest {
        LockRequest {
            user_id: user_id.to_string(),
            chain_code: engine.chain.chain_code.clone(),
            amount: BigDecimal::from_str(amount).unwrap(),
            external_address: "0x00000000000000000000000000000000000000aa".to_string(),
        }
    }

    pub fn unlock_request(
        engine: &Engine,
        user_id: &str,
        amount: &str,
        tx_hash: &str,
    ) -> UnlockRequest {
        UnlockRequest {
            user_id: user_id.to_string(),
            chain_code: engine.chain.chain_code.clone(),
            amount: BigDecimal::from_str(amount).unwrap(),
            external_tx_hash: tx_hash.to_string(),
        }
    }
}

use helpers::*;

#[tokio::test]
#[ignore]
async fn test_lock_debits_amount_plus_fee() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    fund(&pool, &user, "100").await;

    let tx = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .expect("lock should succeed");

    assert_eq!(tx.status, TxStatus::Minted);
    assert!(tx.external_tx_hash.unwrap().starts_with("0xmint"));
    assert!(tx.completed_at.is_some());
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(48));
    assert_eq!(engine.adapter.mint_calls(), 1);
}

#[tokio::test]
#[ignore]
async fn test_lock_mint_failure_refunds_in_full() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    fund(&pool, &user, "100").await;
    engine.adapter.fail_all_mints();

    let err = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .expect_err("mint failure must reject the lock");
    assert_eq!(err.code(), "MINT_SUBMISSION_FAILED");

    // refund completeness: balance as if the lock never happened
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(100));

    let history = db::history(&pool, &user).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TxStatus::Failed);
    assert!(history[0]
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("MintSubmissionFailed"));
}

#[tokio::test]
#[ignore]
async fn test_lock_minimum_amount_boundary() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "0.5").await;
    let user = unique("did:semilla:u");
    fund(&pool, &user, "100").await;

    let err = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "9.99999999"))
        .await
        .expect_err("just below minimum must be rejected");
    assert_eq!(err.code(), "BELOW_MINIMUM_AMOUNT");
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(100));

    let tx = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "10"))
        .await
        .expect("exactly the minimum must succeed");
    assert_eq!(tx.status, TxStatus::Minted);
}

#[tokio::test]
#[ignore]
async fn test_lock_insufficient_balance_leaves_no_trace() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    fund(&pool, &user, "10").await;

    // 10 + 2 fee > 10 balance
    let err = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "10"))
        .await
        .expect_err("insufficient balance must be rejected");
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");

    // atomicity: no debit, no transaction row
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(10));
    assert!(db::history(&pool, &user).await.unwrap().is_empty());
    assert_eq!(engine.adapter.mint_calls(), 0);
}

#[tokio::test]
#[ignore]
async fn test_unlock_credits_full_amount() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    let burn = unique("0xburn");
    engine.adapter.confirm_burn(&burn, "25");

    let tx = engine
        .orchestrator
        .unlock(unlock_request(&engine, &user, "25", &burn))
        .await
        .expect("verified burn must unlock");

    assert_eq!(tx.status, TxStatus::Unlocked);
    // no fee on unlock
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(25));
}

#[tokio::test]
#[ignore]
async fn test_unlock_unverified_burn_fails_then_retry_succeeds() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    let burn = unique("0xburn");

    let err = engine
        .orchestrator
        .unlock(unlock_request(&engine, &user, "25", &burn))
        .await
        .expect_err("unknown burn must fail");
    assert_eq!(err.code(), "BURN_NOT_VERIFIED");
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(0));

    // the failed row released the hash; a later legitimate claim works
    engine.adapter.confirm_burn(&burn, "25");
    let tx = engine
        .orchestrator
        .unlock(unlock_request(&engine, &user, "25", &burn))
        .await
        .expect("retry after confirmation must succeed");
    assert_eq!(tx.status, TxStatus::Unlocked);
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(25));
}

#[tokio::test]
#[ignore]
async fn test_unlock_underfunded_burn_is_rejected() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    let burn = unique("0xburn");
    // burned 20 but claiming 25
    engine.adapter.confirm_burn(&burn, "20");

    let err = engine
        .orchestrator
        .unlock(unlock_request(&engine, &user, "25", &burn))
        .await
        .expect_err("claim above burned amount must fail");
    assert_eq!(err.code(), "BURN_NOT_VERIFIED");
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(0));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_duplicate_unlock_single_winner() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    let burn = unique("0xburn");
    engine.adapter.confirm_burn(&burn, "25");

    let (a, b) = tokio::join!(
        engine
            .orchestrator
            .unlock(unlock_request(&engine, &user, "25", &burn)),
        engine
            .orchestrator
            .unlock(unlock_request(&engine, &user, "25", &burn)),
    );

    let results = [a, b];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.code() == "DUPLICATE_TX_HASH"))
        .count();

    assert_eq!(successes, 1, "exactly one unlock may win");
    assert_eq!(duplicates, 1, "the loser must see DUPLICATE_TX_HASH");

    // credited exactly once
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(25));

    let history = db::history(&pool, &user).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        history
            .iter()
            .filter(|t| t.status == TxStatus::Unlocked)
            .count(),
        1
    );
    assert_eq!(
        history
            .iter()
            .filter(|t| t.status == TxStatus::Failed
                && t.failure_reason.as_deref() == Some("DuplicateTxHash"))
            .count(),
        1
    );
}

#[tokio::test]
#[ignore]
async fn test_external_tx_hash_unique_across_all_live_rows() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    let burn = unique("0xburn");
    engine.adapter.confirm_burn(&burn, "25");

    let _ = engine
        .orchestrator
        .unlock(unlock_request(&engine, &user, "25", &burn))
        .await;
    let _ = engine
        .orchestrator
        .unlock(unlock_request(&engine, &user, "25", &burn))
        .await;

    // the invariant holds across the entire transaction set
    let dupes: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT chain_code, external_tx_hash FROM bridge_transactions
        WHERE external_tx_hash IS NOT NULL AND status <> 'failed'
        GROUP BY chain_code, external_tx_hash
        HAVING COUNT(*) > 1
        "#,
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert!(dupes.is_empty(), "live hash duplicated: {dupes:?}");
}

#[tokio::test]
#[ignore]
async fn test_breaker_blocks_until_manually_closed() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    fund(&pool, &user, "100").await;

    engine.breaker.open("manual halt for drill");

    let err = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .expect_err("open breaker must reject");
    assert_eq!(err.code(), "CIRCUIT_BREAKER_OPEN");
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(100));

    engine.breaker.close();

    let tx = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .expect("identical call after close must succeed");
    assert_eq!(tx.status, TxStatus::Minted);
}

#[tokio::test]
#[ignore]
async fn test_breaker_auto_trips_on_repeated_critical_events() {
    let Some(pool) = connect().await else { return };
    // threshold 3: the 4th critical event within the window trips
    let engine = engine_with_security(pool.clone(), "10", "2", test_security_config()).await;
    let user = unique("did:semilla:u");

    for i in 0..4 {
        engine
            .monitor
            .record(EventDetails::RefundFailed {
                user_id: user.clone(),
                transaction_id: i,
                amount: "50".to_string(),
            })
            .await
            .expect("event recording");
    }

    assert!(engine.breaker.is_open(), "4 criticals above threshold 3 must trip");
    let reason = engine.breaker.reason().expect("open breaker has a reason");
    assert!(reason.contains("auto"), "auto trip reason was: {reason}");
}

#[tokio::test]
#[ignore]
async fn test_blacklist_add_is_idempotent_and_enforced() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:mallory");
    fund(&pool, &user, "100").await;

    let first = engine
        .blacklist
        .add(EntryType::Did, &user, "probing attempts")
        .await
        .unwrap();
    let second = engine
        .blacklist
        .add(EntryType::Did, &user, "probing attempts")
        .await
        .unwrap();
    assert_eq!(first.id, second.id, "re-add must not create a second row");

    let active: Vec<_> = engine
        .blacklist
        .entries()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.value == user && e.active)
        .collect();
    assert_eq!(active.len(), 1);

    let err = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .expect_err("blacklisted identity must be rejected");
    assert_eq!(err.code(), "BLACKLISTED");
    assert_eq!(balance_of(&pool, &user).await, BigDecimal::from(100));

    // soft removal restores access and keeps the row
    assert!(engine.blacklist.remove(first.id).await.unwrap());
    let kept: Vec<_> = engine
        .blacklist
        .entries()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.value == user)
        .collect();
    assert_eq!(kept.len(), 1);
    assert!(!kept[0].active);
    assert!(kept[0].removed_at.is_some());

    engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .expect("removed entry must no longer block");
}

#[tokio::test]
#[ignore]
async fn test_blacklist_hit_emits_high_severity_event() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:mallory");
    fund(&pool, &user, "100").await;

    engine
        .blacklist
        .add(EntryType::Did, &user, "wash trading")
        .await
        .unwrap();
    let _ = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await;

    let events = engine.monitor.events(100, 0).await.unwrap();
    let hit = events
        .iter()
        .find(|e| e.event_type == "BLACKLIST_HIT" && e.details.contains(&user))
        .expect("blacklist hit must be recorded");
    assert_eq!(hit.severity, semilla_bridge::types::Severity::High);
    assert!(hit.details.contains("wash trading"));
}

#[tokio::test]
#[ignore]
async fn test_no_transition_out_of_terminal_state() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    fund(&pool, &user, "100").await;

    let tx = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .unwrap();
    assert_eq!(tx.status, TxStatus::Minted);
    let balance_after = balance_of(&pool, &user).await;

    // every transition out of the terminal row must be refused
    assert!(!db::mark_locked(&pool, tx.id).await.unwrap());
    assert!(!db::mark_verified(&pool, tx.id).await.unwrap());
    assert!(!db::mark_minted(&pool, tx.id, "0xother").await.unwrap());
    assert!(!db::complete_unlock(&pool, tx.id).await.unwrap());
    assert!(!db::fail_lock_with_refund(&pool, tx.id, "late failure").await.unwrap());

    // and the refused refund must not have touched the balance
    assert_eq!(balance_of(&pool, &user).await, balance_after);

    let reread = db::get_transaction(&pool, tx.id).await.unwrap().unwrap();
    assert_eq!(reread.status, TxStatus::Minted);
}

#[tokio::test]
#[ignore]
async fn test_repeated_failed_unlocks_flag_probing() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:mallory");

    for i in 0..3 {
        let burn = unique(&format!("0xprobe{i}"));
        let _ = engine
            .orchestrator
            .unlock(unlock_request(&engine, &user, "25", &burn))
            .await;
    }

    let events = engine.monitor.events(200, 0).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == "REPEATED_FAILED_UNLOCK" && e.details.contains(&user)),
        "third failed unlock in the window must escalate"
    );
}

#[tokio::test]
#[ignore]
async fn test_stale_transactions_query_scopes_to_non_terminal() {
    let Some(pool) = connect().await else { return };
    let engine = engine(pool.clone(), "10", "2").await;
    let user = unique("did:semilla:u");
    fund(&pool, &user, "100").await;

    // terminal row: must never be reported stale
    let tx = engine
        .orchestrator
        .lock(lock_request(&engine, &user, "50"))
        .await
        .unwrap();

    let cutoff = chrono::Utc::now() + chrono::Duration::hours(1);
    let stale = db::stale_transactions(&pool, cutoff).await.unwrap();
    assert!(
        stale.iter().all(|t| t.id != tx.id),
        "terminal transactions are not stale"
    );
    assert!(stale.iter().all(|t| !t.status.is_terminal()));
}
