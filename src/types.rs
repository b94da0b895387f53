//! Common types for the bridge settlement engine
//!
//! The status enums carry sqlx::Type derives so rows can be read directly
//! into typed fields; the database stores the lowercase string forms.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a bridge transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Internal balance into custody, wrapped asset minted externally
    Lock,
    /// Wrapped asset burned externally, internal balance released
    Unlock,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Lock => "lock",
            Direction::Unlock => "unlock",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bridge transaction state machine
///
/// lock:   pending -> locked -> minted, or pending/locked -> failed
/// unlock: pending -> verified -> unlocked, or pending -> failed
///
/// `minted`, `unlocked`, and `failed` are terminal. Guarded SQL updates
/// enforce the same table at the storage level; this enum is the in-process
/// source of truth for what those guards allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Locked,
    Minted,
    Verified,
    Unlocked,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Locked => "locked",
            TxStatus::Minted => "minted",
            TxStatus::Verified => "verified",
            TxStatus::Unlocked => "unlocked",
            TxStatus::Failed => "failed",
        }
    }

    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Minted | TxStatus::Unlocked | TxStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition for `direction`
    pub fn can_transition(&self, next: TxStatus, direction: Direction) -> bool {
        use TxStatus::*;
        match (direction, *self, next) {
            (Direction::Lock, Pending, Locked) => true,
            (Direction::Lock, Locked, Minted) => true,
            (Direction::Lock, Pending, Failed) => true,
            (Direction::Lock, Locked, Failed) => true,
            (Direction::Unlock, Pending, Verified) => true,
            (Direction::Unlock, Verified, Unlocked) => true,
            (Direction::Unlock, Pending, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of identity a blacklist entry blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Decentralized identifier of a platform user
    Did,
    /// External-chain address
    Address,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Did => "did",
            EntryType::Address => "address",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Security event severity. Ordering matters: `Critical` is the only level
/// that can auto-trip the circuit breaker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TxStatus::Minted.is_terminal());
        assert!(TxStatus::Unlocked.is_terminal());
        assert!(TxStatus::Failed.is_terminal());
        assert!(!TxStatus::Pending.is_terminal());
        assert!(!TxStatus::Locked.is_terminal());
        assert!(!TxStatus::Verified.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        use TxStatus::*;
        let all = [Pending, Locked, Minted, Verified, Unlocked, Failed];
        for from in [Minted, Unlocked, Failed] {
            for to in all {
                for dir in [Direction::Lock, Direction::Unlock] {
                    assert!(
                        !from.can_transition(to, dir),
                        "{from} -> {to} ({dir}) must be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn test_lock_success_path() {
        assert!(TxStatus::Pending.can_transition(TxStatus::Locked, Direction::Lock));
        assert!(TxStatus::Locked.can_transition(TxStatus::Minted, Direction::Lock));
        assert!(!TxStatus::Pending.can_transition(TxStatus::Minted, Direction::Lock));
    }

    #[test]
    fn test_unlock_success_path() {
        assert!(TxStatus::Pending.can_transition(TxStatus::Verified, Direction::Unlock));
        assert!(TxStatus::Verified.can_transition(TxStatus::Unlocked, Direction::Unlock));
        assert!(!TxStatus::Pending.can_transition(TxStatus::Unlocked, Direction::Unlock));
    }

    #[test]
    fn test_direction_mismatch_rejected() {
        assert!(!TxStatus::Pending.can_transition(TxStatus::Verified, Direction::Lock));
        assert!(!TxStatus::Pending.can_transition(TxStatus::Locked, Direction::Unlock));
        // unlock has no custody to unwind after verification
        assert!(!TxStatus::Verified.can_transition(TxStatus::Failed, Direction::Unlock));
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(TxStatus::Pending.as_str(), "pending");
        assert_eq!(TxStatus::Unlocked.as_str(), "unlocked");
        assert_eq!(Direction::Lock.as_str(), "lock");
        assert_eq!(Severity::Critical.as_str(), "critical");
        assert_eq!(EntryType::Did.as_str(), "did");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
