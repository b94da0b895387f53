//! Blacklist enforcement
//!
//! Rows live in Postgres (soft-deleted only, audit requirement); every
//! request reads a version-tagged in-memory snapshot instead of hitting
//! storage. Writes are rare (admin action) and refresh the snapshot.

use std::collections::HashMap;
use std::sync::RwLock;

use eyre::Result;
use sqlx::PgPool;

use crate::db::{self, BlacklistEntry};
use crate::types::EntryType;

/// A matched blacklist entry, carried into the security event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistMatch {
    pub entry_type: EntryType,
    pub value: String,
    pub reason: String,
}

/// Read-optimized view of the active entries
#[derive(Debug, Default, Clone)]
pub struct BlacklistSnapshot {
    dids: HashMap<String, String>,
    addresses: HashMap<String, String>,
    version: u64,
}

impl BlacklistSnapshot {
    pub fn from_entries(entries: &[BlacklistEntry], version: u64) -> Self {
        let mut dids = HashMap::new();
        let mut addresses = HashMap::new();
        for entry in entries.iter().filter(|e| e.active) {
            match entry.entry_type {
                EntryType::Did => dids.insert(entry.value.clone(), entry.reason.clone()),
                EntryType::Address => {
                    addresses.insert(entry.value.clone(), entry.reason.clone())
                }
            };
        }
        Self {
            dids,
            addresses,
            version,
        }
    }

    /// First match wins: the requesting identity is checked before the
    /// external address.
    pub fn check(&self, did: Option<&str>, address: Option<&str>) -> Option<BlacklistMatch> {
        if let Some(did) = did {
            if let Some(reason) = self.dids.get(did) {
                return Some(BlacklistMatch {
                    entry_type: EntryType::Did,
                    value: did.to_string(),
                    reason: reason.clone(),
                });
            }
        }
        if let Some(address) = address {
            if let Some(reason) = self.addresses.get(address) {
                return Some(BlacklistMatch {
                    entry_type: EntryType::Address,
                    value: address.to_string(),
                    reason: reason.clone(),
                });
            }
        }
        None
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.dids.len() + self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dids.is_empty() && self.addresses.is_empty()
    }
}

/// DB-backed enforcer holding the current snapshot
pub struct BlacklistEnforcer {
    pool: PgPool,
    snapshot: RwLock<BlacklistSnapshot>,
}

impl BlacklistEnforcer {
    /// Load the active entries and build the initial snapshot
    pub async fn load(pool: PgPool) -> Result<Self> {
        let enforcer = Self {
            pool,
            snapshot: RwLock::new(BlacklistSnapshot::default()),
        };
        enforcer.refresh().await?;
        Ok(enforcer)
    }

    /// Rebuild the snapshot from storage, bumping the version
    pub async fn refresh(&self) -> Result<()> {
        let entries = db::active_blacklist(&self.pool).await?;
        let mut snapshot = self.snapshot.write().expect("blacklist lock poisoned");
        let version = snapshot.version() + 1;
        *snapshot = BlacklistSnapshot::from_entries(&entries, version);
        Ok(())
    }

    /// Snapshot read used by the orchestrator's validation pipeline
    pub fn check(&self, did: Option<&str>, address: Option<&str>) -> Option<BlacklistMatch> {
        self.snapshot
            .read()
            .expect("blacklist lock poisoned")
            .check(did, address)
    }

    pub fn is_blocked(&self, did: Option<&str>, address: Option<&str>) -> bool {
        self.check(did, address).is_some()
    }

    pub fn snapshot(&self) -> BlacklistSnapshot {
        self.snapshot
            .read()
            .expect("blacklist lock poisoned")
            .clone()
    }

    /// Idempotent add. Re-adding an already-active entry leaves exactly one
    /// active row.
    pub async fn add(
        &self,
        entry_type: EntryType,
        value: &str,
        reason: &str,
    ) -> Result<BlacklistEntry> {
        let entry = db::upsert_blacklist_entry(&self.pool, entry_type, value, reason).await?;
        self.refresh().await?;
        tracing::info!(
            entry_type = %entry_type,
            value,
            "blacklist entry added"
        );
        Ok(entry)
    }

    /// Soft removal; the row is kept for audit. Returns false for unknown or
    /// already-inactive entries.
    pub async fn remove(&self, id: i64) -> Result<bool> {
        let removed = db::deactivate_blacklist_entry(&self.pool, id).await?;
        if removed {
            self.refresh().await?;
            tracing::info!(id, "blacklist entry deactivated");
        }
        Ok(removed)
    }

    pub async fn entries(&self) -> Result<Vec<BlacklistEntry>> {
        db::list_blacklist(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: i64, entry_type: EntryType, value: &str, reason: &str, active: bool) -> BlacklistEntry {
        BlacklistEntry {
            id,
            entry_type,
            value: value.to_string(),
            reason: reason.to_string(),
            active,
            added_at: Utc::now(),
            removed_at: None,
        }
    }

    #[test]
    fn test_did_match() {
        let snapshot = BlacklistSnapshot::from_entries(
            &[entry(1, EntryType::Did, "did:semilla:mallory", "wash trading", true)],
            1,
        );
        let hit = snapshot.check(Some("did:semilla:mallory"), None).unwrap();
        assert_eq!(hit.entry_type, EntryType::Did);
        assert_eq!(hit.reason, "wash trading");
        assert!(snapshot.check(Some("did:semilla:alice"), None).is_none());
    }

    #[test]
    fn test_address_match() {
        let snapshot = BlacklistSnapshot::from_entries(
            &[entry(1, EntryType::Address, "0xdead", "sanctioned", true)],
            1,
        );
        assert!(snapshot.check(None, Some("0xdead")).is_some());
        assert!(snapshot.check(Some("0xdead"), None).is_none(), "types are distinct namespaces");
    }

    #[test]
    fn test_inactive_entries_do_not_match() {
        let snapshot = BlacklistSnapshot::from_entries(
            &[entry(1, EntryType::Did, "did:semilla:mallory", "old incident", false)],
            1,
        );
        assert!(snapshot.check(Some("did:semilla:mallory"), None).is_none());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_did_checked_before_address() {
        let snapshot = BlacklistSnapshot::from_entries(
            &[
                entry(1, EntryType::Did, "did:semilla:mallory", "identity block", true),
                entry(2, EntryType::Address, "0xdead", "address block", true),
            ],
            1,
        );
        let hit = snapshot
            .check(Some("did:semilla:mallory"), Some("0xdead"))
            .unwrap();
        assert_eq!(hit.reason, "identity block");
    }
}
