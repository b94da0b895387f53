use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{Direction, EntryType, Severity, TxStatus};

// Note: We use String for amount fields to avoid BigDecimal/sqlx version
// conflicts. The database stores amounts as NUMERIC(30,8). When inserting, we
// cast text to NUMERIC in the SQL query (e.g., $1::NUMERIC). When reading, we
// cast NUMERIC to TEXT. The same trick carries the security-event JSONB
// payload as text ($1::JSONB / details::TEXT).

/// A supported chain row as stored
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SupportedChainRow {
    pub chain_code: String,
    pub display_name: String,
    pub min_amount: String,
    pub fee: String,
}

/// A bridge transaction and its state-machine position
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BridgeTransaction {
    pub id: i64,
    pub user_id: String,
    pub direction: Direction,
    pub chain_code: String,
    pub amount: String,
    /// Chain fee snapshotted at creation; 0 for unlock
    pub fee: String,
    pub external_address: Option<String>,
    pub external_tx_hash: Option<String>,
    pub status: TxStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// For creating new bridge transactions
#[derive(Debug, Clone)]
pub struct NewBridgeTransaction {
    pub user_id: String,
    pub direction: Direction,
    pub chain_code: String,
    pub amount: String,
    pub external_address: Option<String>,
    pub external_tx_hash: Option<String>,
}

/// A blacklist entry. Soft-deleted via `active = false`, never removed.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: i64,
    pub entry_type: EntryType,
    pub value: String,
    pub reason: String,
    pub active: bool,
    pub added_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

/// A persisted security event. Immutable except for `resolved`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SecurityEventRow {
    pub id: i64,
    pub event_type: String,
    pub severity: Severity,
    /// Tagged-union payload, serialized JSON
    pub details: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}
