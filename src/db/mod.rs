//! Storage layer for the bridge ledger, blacklist, and security events
//!
//! All custody-relevant invariants are enforced here at the storage level:
//!
//! - lock creation debits the balance and inserts the `pending` row in one
//!   SQL transaction; the conditional UPDATE takes the user's balance row
//!   lock, serializing concurrent locks per user
//! - the partial unique index on (chain_code, external_tx_hash) makes the
//!   anti-double-spend invariant a constraint, not an application pre-check
//! - every state transition is a guarded UPDATE (`WHERE status = expected`);
//!   zero rows affected means the transition is illegal and the caller maps
//!   it to `InvalidStateTransition`

use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

pub mod models;

pub use models::*;

use crate::types::TxStatus;

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// SQL SELECT columns for bridge_transactions (casting NUMERIC to TEXT)
const TX_SELECT: &str = r#"id, user_id, direction, chain_code, amount::TEXT as amount,
    fee::TEXT as fee, external_address, external_tx_hash, status, failure_reason,
    created_at, completed_at"#;

// ============ Chain Registry ============

/// All supported chains
pub async fn supported_chains(pool: &PgPool) -> Result<Vec<SupportedChainRow>> {
    let rows = sqlx::query_as::<_, SupportedChainRow>(
        r#"SELECT chain_code, display_name, min_amount::TEXT as min_amount, fee::TEXT as fee
           FROM supported_chains ORDER BY chain_code"#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to load supported chains")?;

    Ok(rows)
}

/// Insert or update a chain's policy (admin tooling and test setup)
pub async fn upsert_chain(
    pool: &PgPool,
    chain_code: &str,
    display_name: &str,
    min_amount: &str,
    fee: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO supported_chains (chain_code, display_name, min_amount, fee)
        VALUES ($1, $2, $3::NUMERIC, $4::NUMERIC)
        ON CONFLICT (chain_code) DO UPDATE SET
            display_name = EXCLUDED.display_name,
            min_amount = EXCLUDED.min_amount,
            fee = EXCLUDED.fee,
            updated_at = NOW()
        "#,
    )
    .bind(chain_code)
    .bind(display_name)
    .bind(min_amount)
    .bind(fee)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to upsert chain {}", chain_code))?;

    Ok(())
}

// ============ Internal Ledger (balances) ============

/// Current balance for a user, if a balance row exists
pub async fn get_balance(pool: &PgPool, user_id: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT balance::TEXT FROM balances WHERE user_id = $1"#)
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .wrap_err("Failed to read balance")?;

    Ok(row.map(|r| r.0))
}

/// Credit a user's balance (creates the row if absent)
pub async fn credit_balance(pool: &PgPool, user_id: &str, amount: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO balances (user_id, balance)
        VALUES ($1, $2::NUMERIC)
        ON CONFLICT (user_id) DO UPDATE SET
            balance = balances.balance + EXCLUDED.balance,
            updated_at = NOW()
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to credit balance for {}", user_id))?;

    Ok(())
}

// ============ Bridge Ledger: creation ============

/// Outcome of a lock creation attempt
#[derive(Debug)]
pub enum LockCreateOutcome {
    Created(BridgeTransaction),
    InsufficientBalance,
}

/// Atomically debit `amount + fee` from the user's balance and insert the
/// `pending` lock row. Either both happen or neither does. The conditional
/// UPDATE locks the balance row, so two concurrent locks by the same user
/// cannot both pass the sufficiency check against a stale balance.
pub async fn create_lock_transaction(
    pool: &PgPool,
    new_tx: &NewBridgeTransaction,
    fee: &str,
) -> Result<LockCreateOutcome> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin lock transaction")?;

    let debited = sqlx::query(
        r#"
        UPDATE balances
        SET balance = balance - ($2::NUMERIC + $3::NUMERIC), updated_at = NOW()
        WHERE user_id = $1 AND balance >= ($2::NUMERIC + $3::NUMERIC)
        "#,
    )
    .bind(&new_tx.user_id)
    .bind(&new_tx.amount)
    .bind(fee)
    .execute(&mut *tx)
    .await
    .wrap_err("Failed to debit balance for lock")?;

    if debited.rows_affected() == 0 {
        tx.rollback()
            .await
            .wrap_err("Failed to roll back lock creation")?;
        return Ok(LockCreateOutcome::InsufficientBalance);
    }

    let query = format!(
        r#"
        INSERT INTO bridge_transactions
            (user_id, direction, chain_code, amount, fee, external_address)
        VALUES ($1, 'lock', $2, $3::NUMERIC, $4::NUMERIC, $5)
        RETURNING {TX_SELECT}
        "#
    );
    let row = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(&new_tx.user_id)
        .bind(&new_tx.chain_code)
        .bind(&new_tx.amount)
        .bind(fee)
        .bind(&new_tx.external_address)
        .fetch_one(&mut *tx)
        .await
        .wrap_err("Failed to insert lock transaction")?;

    tx.commit()
        .await
        .wrap_err("Failed to commit lock creation")?;

    Ok(LockCreateOutcome::Created(row))
}

/// Outcome of an unlock creation attempt
#[derive(Debug)]
pub enum UnlockCreateOutcome {
    Created(BridgeTransaction),
    /// The (chain_code, external_tx_hash) pair is already held by a live or
    /// successful transaction — the unique index rejected the insert
    DuplicateTxHash,
}

/// Insert the `pending` unlock row. The burn hash uniqueness check is the
/// storage constraint itself: a lost race surfaces as a unique violation,
/// never as two accepted rows.
pub async fn create_unlock_transaction(
    pool: &PgPool,
    new_tx: &NewBridgeTransaction,
) -> Result<UnlockCreateOutcome> {
    let query = format!(
        r#"
        INSERT INTO bridge_transactions
            (user_id, direction, chain_code, amount, external_tx_hash)
        VALUES ($1, 'unlock', $2, $3::NUMERIC, $4)
        RETURNING {TX_SELECT}
        "#
    );
    let res = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(&new_tx.user_id)
        .bind(&new_tx.chain_code)
        .bind(&new_tx.amount)
        .bind(&new_tx.external_tx_hash)
        .fetch_one(pool)
        .await;

    match res {
        Ok(row) => Ok(UnlockCreateOutcome::Created(row)),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Ok(UnlockCreateOutcome::DuplicateTxHash)
        }
        Err(e) => Err(e).wrap_err("Failed to insert unlock transaction"),
    }
}

/// Record a rejected unlock attempt as a terminal `failed` row. The partial
/// unique index ignores failed rows, so the audit insert cannot collide with
/// the live consumer of the same hash.
pub async fn insert_failed_unlock_audit(
    pool: &PgPool,
    new_tx: &NewBridgeTransaction,
    reason: &str,
) -> Result<BridgeTransaction> {
    let query = format!(
        r#"
        INSERT INTO bridge_transactions
            (user_id, direction, chain_code, amount, external_tx_hash, status,
             failure_reason, completed_at)
        VALUES ($1, 'unlock', $2, $3::NUMERIC, $4, 'failed', $5, NOW())
        RETURNING {TX_SELECT}
        "#
    );
    let row = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(&new_tx.user_id)
        .bind(&new_tx.chain_code)
        .bind(&new_tx.amount)
        .bind(&new_tx.external_tx_hash)
        .bind(reason)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to insert failed unlock audit row")?;

    Ok(row)
}

// ============ Bridge Ledger: state transitions ============

/// `pending -> locked`: the internal debit is durably recorded, the engine
/// has custody. Returns false when the row is not in `pending`.
pub async fn mark_locked(pool: &PgPool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE bridge_transactions SET status = 'locked' WHERE id = $1 AND status = 'pending'"#,
    )
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark transaction {} locked", id))?;

    Ok(res.rows_affected() > 0)
}

/// `locked -> minted`: the adapter confirmed mint submission. Records the
/// mint transaction hash. Returns false when the row is not in `locked`.
pub async fn mark_minted(pool: &PgPool, id: i64, mint_tx_hash: &str) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE bridge_transactions
        SET status = 'minted', external_tx_hash = $2, completed_at = NOW()
        WHERE id = $1 AND status = 'locked'
        "#,
    )
    .bind(id)
    .bind(mint_tx_hash)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark transaction {} minted", id))?;

    Ok(res.rows_affected() > 0)
}

/// `pending -> verified` (unlock): the burn checked out on the external chain
pub async fn mark_verified(pool: &PgPool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE bridge_transactions SET status = 'verified' WHERE id = $1 AND status = 'pending'"#,
    )
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark transaction {} verified", id))?;

    Ok(res.rows_affected() > 0)
}

/// `verified -> unlocked`: flip the status and credit the full claimed
/// amount in one SQL transaction. Returns false when the row is not in
/// `verified` (nothing is credited in that case).
pub async fn complete_unlock(pool: &PgPool, id: i64) -> Result<bool> {
    let mut tx = pool
        .begin()
        .await
        .wrap_err("Failed to begin unlock completion")?;

    let row: Option<(String, String)> = sqlx::query_as(
        r#"
        UPDATE bridge_transactions
        SET status = 'unlocked', completed_at = NOW()
        WHERE id = $1 AND status = 'verified'
        RETURNING user_id, amount::TEXT
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .wrap_err_with(|| format!("Failed to complete unlock {}", id))?;

    let Some((user_id, amount)) = row else {
        tx.rollback()
            .await
            .wrap_err("Failed to roll back unlock completion")?;
        return Ok(false);
    };

    sqlx::query(
        r#"
        INSERT INTO balances (user_id, balance)
        VALUES ($1, $2::NUMERIC)
        ON CONFLICT (user_id) DO UPDATE SET
            balance = balances.balance + EXCLUDED.balance,
            updated_at = NOW()
        "#,
    )
    .bind(&user_id)
    .bind(&amount)
    .execute(&mut *tx)
    .await
    .wrap_err_with(|| format!("Failed to credit unlock {} to {}", id, user_id))?;

    tx.commit()
        .await
        .wrap_err("Failed to commit unlock completion")?;

    Ok(true)
}

/// Fail a lock transaction and refund `amount + fee` in one SQL transaction.
/// Leaving the debit in place with no mint is a fund-loss bug, so the status
/// flip and the refund are inseparable. Returns false when the row is
/// already terminal.
pub async fn fail_lock_with_refund(pool: &PgPool, id: i64, reason: &str) -> Result<bool> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin lock failure")?;

    let row: Option<(String, String)> = sqlx::query_as(
        r#"
        UPDATE bridge_transactions
        SET status = 'failed', failure_reason = $2, completed_at = NOW()
        WHERE id = $1 AND direction = 'lock' AND status IN ('pending', 'locked')
        RETURNING user_id, (amount + fee)::TEXT
        "#,
    )
    .bind(id)
    .bind(reason)
    .fetch_optional(&mut *tx)
    .await
    .wrap_err_with(|| format!("Failed to fail lock transaction {}", id))?;

    let Some((user_id, refund)) = row else {
        tx.rollback()
            .await
            .wrap_err("Failed to roll back lock failure")?;
        return Ok(false);
    };

    sqlx::query(
        r#"UPDATE balances SET balance = balance + $2::NUMERIC, updated_at = NOW() WHERE user_id = $1"#,
    )
    .bind(&user_id)
    .bind(&refund)
    .execute(&mut *tx)
    .await
    .wrap_err_with(|| format!("Failed to refund {} to {}", refund, user_id))?;

    tx.commit().await.wrap_err("Failed to commit lock failure")?;

    Ok(true)
}

/// Fail an unlock transaction (no internal credit happened, nothing to
/// reverse). Returns false when the row is not in `pending`.
pub async fn fail_unlock(pool: &PgPool, id: i64, reason: &str) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE bridge_transactions
        SET status = 'failed', failure_reason = $2, completed_at = NOW()
        WHERE id = $1 AND direction = 'unlock' AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to fail unlock transaction {}", id))?;

    Ok(res.rows_affected() > 0)
}

// ============ Bridge Ledger: queries ============

pub async fn get_transaction(pool: &PgPool, id: i64) -> Result<Option<BridgeTransaction>> {
    let query = format!("SELECT {TX_SELECT} FROM bridge_transactions WHERE id = $1");
    let row = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get transaction")?;

    Ok(row)
}

/// A user's bridge history, newest first
pub async fn history(pool: &PgPool, user_id: &str) -> Result<Vec<BridgeTransaction>> {
    let query = format!(
        "SELECT {TX_SELECT} FROM bridge_transactions WHERE user_id = $1 ORDER BY created_at DESC"
    );
    let rows = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(user_id)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get transaction history")?;

    Ok(rows)
}

/// Non-terminal transactions created before the cutoff
pub async fn stale_transactions(
    pool: &PgPool,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<BridgeTransaction>> {
    let query = format!(
        r#"SELECT {TX_SELECT} FROM bridge_transactions
           WHERE status IN ('pending', 'locked', 'verified') AND created_at < $1
           ORDER BY created_at ASC"#
    );
    let rows = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to query stale transactions")?;

    Ok(rows)
}

/// Count transactions in a given status
pub async fn count_by_status(pool: &PgPool, status: TxStatus) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM bridge_transactions WHERE status = $1"#)
            .bind(status)
            .fetch_one(pool)
            .await
            .wrap_err("Failed to count transactions by status")?;

    Ok(row.0)
}

// ============ Blacklist ============

const BLACKLIST_SELECT: &str =
    r#"id, entry_type, value, reason, active, added_at, removed_at"#;

/// Idempotent add: re-adding an entry reactivates it and refreshes the
/// reason, leaving exactly one active row per (type, value).
pub async fn upsert_blacklist_entry(
    pool: &PgPool,
    entry_type: crate::types::EntryType,
    value: &str,
    reason: &str,
) -> Result<BlacklistEntry> {
    let query = format!(
        r#"
        INSERT INTO blacklist_entries (entry_type, value, reason)
        VALUES ($1, $2, $3)
        ON CONFLICT (entry_type, value) DO UPDATE SET
            active = TRUE,
            reason = EXCLUDED.reason,
            removed_at = NULL
        RETURNING {BLACKLIST_SELECT}
        "#
    );
    let row = sqlx::query_as::<_, BlacklistEntry>(&query)
        .bind(entry_type)
        .bind(value)
        .bind(reason)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to upsert blacklist entry")?;

    Ok(row)
}

/// Soft removal: flips `active` off and stamps `removed_at`. The row stays
/// for audit. Returns false when the entry is unknown or already inactive.
pub async fn deactivate_blacklist_entry(pool: &PgPool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE blacklist_entries SET active = FALSE, removed_at = NOW() WHERE id = $1 AND active"#,
    )
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to deactivate blacklist entry {}", id))?;

    Ok(res.rows_affected() > 0)
}

/// Every entry, active or not (admin listing)
pub async fn list_blacklist(pool: &PgPool) -> Result<Vec<BlacklistEntry>> {
    let query = format!(
        "SELECT {BLACKLIST_SELECT} FROM blacklist_entries ORDER BY added_at DESC"
    );
    let rows = sqlx::query_as::<_, BlacklistEntry>(&query)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to list blacklist entries")?;

    Ok(rows)
}

/// Active entries only (snapshot refresh)
pub async fn active_blacklist(pool: &PgPool) -> Result<Vec<BlacklistEntry>> {
    let query = format!(
        "SELECT {BLACKLIST_SELECT} FROM blacklist_entries WHERE active ORDER BY added_at DESC"
    );
    let rows = sqlx::query_as::<_, BlacklistEntry>(&query)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to load active blacklist entries")?;

    Ok(rows)
}

// ============ Security Events ============

const EVENT_SELECT: &str =
    r#"id, event_type, severity, details::TEXT as details, resolved, created_at"#;

pub async fn insert_security_event(
    pool: &PgPool,
    event_type: &str,
    severity: crate::types::Severity,
    details_json: &str,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO security_events (event_type, severity, details)
        VALUES ($1, $2, $3::JSONB)
        RETURNING id
        "#,
    )
    .bind(event_type)
    .bind(severity)
    .bind(details_json)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to insert security event")?;

    Ok(row.get("id"))
}

/// Recent events, newest first
pub async fn list_security_events(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<SecurityEventRow>> {
    let query = format!(
        r#"SELECT {EVENT_SELECT} FROM security_events
           ORDER BY created_at DESC LIMIT $1 OFFSET $2"#
    );
    let rows = sqlx::query_as::<_, SecurityEventRow>(&query)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to list security events")?;

    Ok(rows)
}

/// Mark an event resolved (the only mutation events allow)
pub async fn resolve_security_event(pool: &PgPool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE security_events SET resolved = TRUE WHERE id = $1 AND NOT resolved"#,
    )
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to resolve security event {}", id))?;

    Ok(res.rows_affected() > 0)
}

/// Lifetime event count
pub async fn count_security_events(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM security_events"#)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count security events")?;

    Ok(row.0)
}
