//! Security monitor
//!
//! Ingests typed security events, persists them for audit, and keeps an
//! in-memory sliding window (lazy eviction, no calendar buckets) for rolling
//! stats and the auto-trip decision. Repeated CRITICAL events within the
//! configured window are the canonical signature of an active exploit and
//! the single case where the monitor intervenes by opening the breaker;
//! every other severity is advisory.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::breaker::CircuitBreaker;
use crate::config::SecurityConfig;
use crate::db;
use crate::metrics;
use crate::types::{EntryType, Severity, TxStatus};

/// Typed payloads for security events. The serialized tagged form is what
/// lands in the JSONB column; `event_type` and the default severity derive
/// from the variant, so pattern matching over event kinds is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventDetails {
    BlacklistHit {
        user_id: String,
        entry_type: EntryType,
        value: String,
        reason: String,
    },
    DuplicateTxHash {
        user_id: String,
        chain_code: String,
        tx_hash: String,
    },
    BurnNotVerified {
        user_id: String,
        chain_code: String,
        tx_hash: String,
        detail: String,
    },
    MintFailed {
        user_id: String,
        chain_code: String,
        transaction_id: i64,
        detail: String,
    },
    RefundFailed {
        user_id: String,
        transaction_id: i64,
        amount: String,
    },
    RepeatedFailedUnlock {
        user_id: String,
        failures_in_window: u64,
    },
    StaleTransaction {
        transaction_id: i64,
        status: TxStatus,
        age_secs: i64,
    },
    BreakerOpened {
        reason: String,
        automatic: bool,
    },
    BreakerClosed {
        note: Option<String>,
    },
}

impl EventDetails {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventDetails::BlacklistHit { .. } => "BLACKLIST_HIT",
            EventDetails::DuplicateTxHash { .. } => "DUPLICATE_TX_HASH",
            EventDetails::BurnNotVerified { .. } => "BURN_NOT_VERIFIED",
            EventDetails::MintFailed { .. } => "MINT_FAILED",
            EventDetails::RefundFailed { .. } => "REFUND_FAILED",
            EventDetails::RepeatedFailedUnlock { .. } => "REPEATED_FAILED_UNLOCK",
            EventDetails::StaleTransaction { .. } => "STALE_TRANSACTION",
            EventDetails::BreakerOpened { .. } => "BREAKER_OPENED",
            EventDetails::BreakerClosed { .. } => "BREAKER_CLOSED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EventDetails::BlacklistHit { .. } => Severity::High,
            EventDetails::DuplicateTxHash { .. } => Severity::High,
            EventDetails::BurnNotVerified { .. } => Severity::Medium,
            EventDetails::MintFailed { .. } => Severity::Medium,
            // A debit with no mint and no refund is lost user money; this is
            // the page-an-operator event.
            EventDetails::RefundFailed { .. } => Severity::Critical,
            EventDetails::RepeatedFailedUnlock { .. } => Severity::High,
            EventDetails::StaleTransaction { .. } => Severity::Medium,
            EventDetails::BreakerOpened { .. } => Severity::High,
            EventDetails::BreakerClosed { .. } => Severity::Medium,
        }
    }

    /// The user behind a failed unlock attempt, for probing detection
    fn failed_unlock_user(&self) -> Option<&str> {
        match self {
            EventDetails::DuplicateTxHash { user_id, .. }
            | EventDetails::BurnNotVerified { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct WindowEvent {
    at: DateTime<Utc>,
    severity: Severity,
    event_type: &'static str,
    failed_unlock_user: Option<String>,
}

/// Sliding event window with lazy eviction
#[derive(Debug)]
pub struct RollingWindow {
    events: VecDeque<WindowEvent>,
    retention: Duration,
}

impl RollingWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            retention,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff =
            now - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());
        while let Some(front) = self.events.front() {
            if front.at < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, event: WindowEvent, now: DateTime<Utc>) {
        self.prune(now);
        self.events.push_back(event);
    }

    fn within(&self, now: DateTime<Utc>, window: Duration) -> impl Iterator<Item = &WindowEvent> {
        let cutoff =
            now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.events.iter().filter(move |e| e.at >= cutoff)
    }

    fn count_within(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        self.within(now, window).count() as u64
    }

    fn count_severity_within(
        &self,
        severity: Severity,
        now: DateTime<Utc>,
        window: Duration,
    ) -> u64 {
        self.within(now, window)
            .filter(|e| e.severity == severity)
            .count() as u64
    }

    fn count_failed_unlocks(&self, user_id: &str, now: DateTime<Utc>, window: Duration) -> u64 {
        self.within(now, window)
            .filter(|e| e.failed_unlock_user.as_deref() == Some(user_id))
            .count() as u64
    }

    fn by_severity_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for event in self.within(now, window) {
            *counts.entry(event.severity.to_string()).or_insert(0) += 1;
        }
        counts
    }

    fn top_types_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Vec<TypeCount> {
        let mut counts: HashMap<&'static str, u64> = HashMap::new();
        for event in self.within(now, window) {
            *counts.entry(event.event_type).or_insert(0) += 1;
        }
        let mut sorted: Vec<_> = counts
            .into_iter()
            .map(|(event_type, count)| TypeCount {
                event_type: event_type.to_string(),
                count,
            })
            .collect();
        // count desc, then name for determinism
        sorted.sort_by(|a, b| b.count.cmp(&a.count).then(a.event_type.cmp(&b.event_type)));
        sorted.truncate(limit);
        sorted
    }
}

/// Auto-trip decision over the window: strictly more CRITICAL events than
/// the threshold within the window yields a reason.
pub fn evaluate_trip(
    window: &RollingWindow,
    now: DateTime<Utc>,
    threshold: u64,
    trip_window: Duration,
) -> Option<String> {
    let criticals = window.count_severity_within(Severity::Critical, now, trip_window);
    if criticals > threshold {
        Some(format!(
            "auto: {} critical events in last {}m",
            criticals,
            trip_window.as_secs() / 60
        ))
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeCount {
    pub event_type: String,
    pub count: u64,
}

/// Point-in-time rolling statistics served to the admin dashboard
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    pub total: i64,
    pub last_24h: u64,
    pub last_1h: u64,
    pub critical_last_1h: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub top_types: Vec<TypeCount>,
}

const DAY: Duration = Duration::from_secs(24 * 3600);
const HOUR: Duration = Duration::from_secs(3600);
const TOP_TYPES_LIMIT: usize = 5;

/// The monitor. Owns the rolling window, persists every event, and trips
/// the injected breaker when the critical-event policy fires.
pub struct SecurityMonitor {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
    config: SecurityConfig,
    window: Mutex<RollingWindow>,
}

impl SecurityMonitor {
    pub fn new(pool: PgPool, breaker: Arc<CircuitBreaker>, config: SecurityConfig) -> Self {
        // retention must cover both the 24h stats horizon and the trip window
        let retention = DAY.max(config.trip_window());
        Self {
            pool,
            breaker,
            config,
            window: Mutex::new(RollingWindow::new(retention)),
        }
    }

    /// Record an event: persist, track in the window, then run the
    /// escalation policies (probing detection, breaker auto-trip).
    pub async fn record(&self, details: EventDetails) -> Result<i64> {
        let id = self.persist_and_track(&details).await?;

        if let Some(user_id) = details.failed_unlock_user() {
            let now = Utc::now();
            let failures = {
                let window = self.window.lock().expect("monitor lock poisoned");
                window.count_failed_unlocks(user_id, now, self.config.trip_window())
            };
            // emit once, when the threshold is crossed
            if failures == self.config.repeated_unlock_threshold {
                self.persist_and_track(&EventDetails::RepeatedFailedUnlock {
                    user_id: user_id.to_string(),
                    failures_in_window: failures,
                })
                .await?;
            }
        }

        if let Some(reason) = self.should_trip_breaker() {
            if self.breaker.open(&reason) {
                metrics::record_breaker_trip("auto");
                self.persist_and_track(&EventDetails::BreakerOpened {
                    reason,
                    automatic: true,
                })
                .await?;
            }
        }

        Ok(id)
    }

    async fn persist_and_track(&self, details: &EventDetails) -> Result<i64> {
        let severity = details.severity();
        let event_type = details.event_type();
        let payload = serde_json::to_string(details)?;

        let id = db::insert_security_event(&self.pool, event_type, severity, &payload).await?;
        metrics::record_security_event(severity.as_str(), event_type);

        tracing::warn!(
            event_type,
            severity = %severity,
            event_id = id,
            "security event recorded"
        );

        let now = Utc::now();
        let mut window = self.window.lock().expect("monitor lock poisoned");
        window.push(
            WindowEvent {
                at: now,
                severity,
                event_type,
                failed_unlock_user: details.failed_unlock_user().map(str::to_string),
            },
            now,
        );
        Ok(id)
    }

    /// Whether the critical-event policy says the breaker should open now
    pub fn should_trip_breaker(&self) -> Option<String> {
        if self.breaker.is_open() {
            return None;
        }
        let window = self.window.lock().expect("monitor lock poisoned");
        evaluate_trip(
            &window,
            Utc::now(),
            self.config.critical_trip_threshold,
            self.config.trip_window(),
        )
    }

    /// Rolling statistics; lifetime total comes from storage, the rolling
    /// figures from the in-memory window.
    pub async fn stats(&self) -> Result<SecurityStats> {
        let total = db::count_security_events(&self.pool).await?;
        let now = Utc::now();
        let window = self.window.lock().expect("monitor lock poisoned");
        Ok(SecurityStats {
            total,
            last_24h: window.count_within(now, DAY),
            last_1h: window.count_within(now, HOUR),
            critical_last_1h: window.count_severity_within(Severity::Critical, now, HOUR),
            by_severity: window.by_severity_within(now, DAY),
            top_types: window.top_types_within(now, DAY, TOP_TYPES_LIMIT),
        })
    }

    pub async fn events(&self, limit: i64, offset: i64) -> Result<Vec<db::SecurityEventRow>> {
        db::list_security_events(&self.pool, limit, offset).await
    }

    pub async fn resolve(&self, id: i64) -> Result<bool> {
        db::resolve_security_event(&self.pool, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn critical_at(at: DateTime<Utc>) -> WindowEvent {
        WindowEvent {
            at,
            severity: Severity::Critical,
            event_type: "REFUND_FAILED",
            failed_unlock_user: None,
        }
    }

    fn failed_unlock_at(at: DateTime<Utc>, user: &str) -> WindowEvent {
        WindowEvent {
            at,
            severity: Severity::Medium,
            event_type: "BURN_NOT_VERIFIED",
            failed_unlock_user: Some(user.to_string()),
        }
    }

    #[test]
    fn test_trip_fires_above_threshold_only() {
        let mut window = RollingWindow::new(DAY);
        let now = Utc::now();

        for i in 0..3 {
            window.push(critical_at(now - chrono::Duration::minutes(i)), now);
        }
        assert!(
            evaluate_trip(&window, now, 3, HOUR).is_none(),
            "exactly at threshold must not trip"
        );

        window.push(critical_at(now), now);
        let reason = evaluate_trip(&window, now, 3, HOUR).expect("4 criticals must trip");
        assert!(reason.contains("auto"));
        assert!(reason.contains('4'));
    }

    #[test]
    fn test_trip_ignores_events_outside_window() {
        let mut window = RollingWindow::new(DAY);
        let now = Utc::now();

        // 4 criticals, but 2 of them older than the 1h window
        window.push(critical_at(now - chrono::Duration::minutes(90)), now);
        window.push(critical_at(now - chrono::Duration::minutes(70)), now);
        window.push(critical_at(now - chrono::Duration::minutes(10)), now);
        window.push(critical_at(now), now);

        assert!(evaluate_trip(&window, now, 3, HOUR).is_none());
    }

    #[test]
    fn test_trip_ignores_non_critical() {
        let mut window = RollingWindow::new(DAY);
        let now = Utc::now();
        for _ in 0..10 {
            window.push(failed_unlock_at(now, "did:semilla:mallory"), now);
        }
        assert!(evaluate_trip(&window, now, 3, HOUR).is_none());
    }

    #[test]
    fn test_retention_evicts_old_events() {
        let mut window = RollingWindow::new(HOUR);
        let now = Utc::now();
        window.push(critical_at(now - chrono::Duration::hours(2)), now);
        window.push(critical_at(now), now);
        // eviction happens on push
        assert_eq!(window.count_within(now, DAY), 1);
    }

    #[test]
    fn test_failed_unlock_counting_is_per_user() {
        let mut window = RollingWindow::new(DAY);
        let now = Utc::now();
        window.push(failed_unlock_at(now, "did:semilla:mallory"), now);
        window.push(failed_unlock_at(now, "did:semilla:mallory"), now);
        window.push(failed_unlock_at(now, "did:semilla:alice"), now);

        assert_eq!(window.count_failed_unlocks("did:semilla:mallory", now, HOUR), 2);
        assert_eq!(window.count_failed_unlocks("did:semilla:alice", now, HOUR), 1);
        assert_eq!(window.count_failed_unlocks("did:semilla:bob", now, HOUR), 0);
    }

    #[test]
    fn test_top_types_sorted_and_capped() {
        let mut window = RollingWindow::new(DAY);
        let now = Utc::now();
        for _ in 0..3 {
            window.push(failed_unlock_at(now, "u"), now);
        }
        window.push(critical_at(now), now);

        let top = window.top_types_within(now, DAY, 5);
        assert_eq!(top[0].event_type, "BURN_NOT_VERIFIED");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].event_type, "REFUND_FAILED");
    }

    #[test]
    fn test_event_type_and_severity_mapping() {
        let refund = EventDetails::RefundFailed {
            user_id: "did:semilla:alice".into(),
            transaction_id: 7,
            amount: "52.5".into(),
        };
        assert_eq!(refund.event_type(), "REFUND_FAILED");
        assert_eq!(refund.severity(), Severity::Critical);

        let hit = EventDetails::BlacklistHit {
            user_id: "did:semilla:mallory".into(),
            entry_type: EntryType::Did,
            value: "did:semilla:mallory".into(),
            reason: "probing".into(),
        };
        assert_eq!(hit.event_type(), "BLACKLIST_HIT");
        assert_eq!(hit.severity(), Severity::High);

        let closed = EventDetails::BreakerClosed { note: None };
        assert_eq!(closed.severity(), Severity::Medium);
    }

    #[test]
    fn test_details_serialize_with_tag() {
        let details = EventDetails::DuplicateTxHash {
            user_id: "did:semilla:mallory".into(),
            chain_code: "POLYGON".into(),
            tx_hash: "0xabc".into(),
        };
        let json = serde_json::to_string(&details).unwrap();
        assert!(json.contains(r#""event":"DUPLICATE_TX_HASH""#));
        assert!(json.contains(r#""tx_hash":"0xabc""#));
    }
}
