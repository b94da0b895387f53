//! Circuit breaker
//!
//! Process-wide halt switch for new bridge operations. Opened manually by an
//! admin or automatically by the security monitor; closed only by an explicit
//! admin action. In-flight transactions past `pending` are never interrupted.
//!
//! Built in `main` (or per test case) and injected — no ambient global.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;

/// Point-in-time view of the breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub open: bool,
    pub reason: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BreakerState {
    open: bool,
    reason: Option<String>,
    opened_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
}

/// The breaker itself. Reads are lock-cheap; writes are rare (admin or
/// monitor trip). The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
}

impl CircuitBreaker {
    /// Initialized closed
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.state.read().expect("breaker lock poisoned").open
    }

    /// Reason of the current open period, if open
    pub fn reason(&self) -> Option<String> {
        let state = self.state.read().expect("breaker lock poisoned");
        if state.open {
            state.reason.clone()
        } else {
            None
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.state.read().expect("breaker lock poisoned");
        BreakerStatus {
            open: state.open,
            reason: state.reason.clone(),
            opened_at: state.opened_at,
            closed_at: state.closed_at,
        }
    }

    /// Open the breaker. Returns false if it was already open (the original
    /// reason is kept — first incident wins).
    pub fn open(&self, reason: &str) -> bool {
        let mut state = self.state.write().expect("breaker lock poisoned");
        if state.open {
            return false;
        }
        state.open = true;
        state.reason = Some(reason.to_string());
        state.opened_at = Some(Utc::now());
        tracing::warn!(reason, "circuit breaker opened, new bridge operations halted");
        true
    }

    /// Close the breaker. Returns false if it was already closed. Never
    /// called automatically — a human confirms the incident is resolved.
    pub fn close(&self) -> bool {
        let mut state = self.state.write().expect("breaker lock poisoned");
        if !state.open {
            return false;
        }
        state.open = false;
        state.reason = None;
        state.closed_at = Some(Utc::now());
        tracing::info!("circuit breaker closed, bridge operations resumed");
        true
    }
}
