//! Staleness watcher
//!
//! Adapter calls are already bounded by a timeout, so a transaction stuck in
//! a non-terminal state means a driver died mid-flight. That is itself a
//! security-relevant anomaly: the watcher sweeps on an interval and emits
//! one MEDIUM event per stuck transaction.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use eyre::Result;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::PolicyConfig;
use crate::db;
use crate::metrics;
use crate::monitor::{EventDetails, SecurityMonitor};

pub struct StalenessWatcher {
    db: PgPool,
    monitor: Arc<SecurityMonitor>,
    policy: PolicyConfig,
    /// Transactions already reported this process lifetime
    reported: HashSet<i64>,
}

impl StalenessWatcher {
    pub fn new(db: PgPool, monitor: Arc<SecurityMonitor>, policy: PolicyConfig) -> Self {
        Self {
            db,
            monitor,
            policy,
            reported: HashSet::new(),
        }
    }

    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            stale_after_secs = self.policy.stale_after_secs,
            interval_secs = self.policy.stale_check_interval_secs,
            "staleness watcher starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(self.policy.stale_check_interval()) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "error sweeping for stale transactions");
                    }
                }
            }
        }

        Ok(())
    }

    async fn sweep(&mut self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.policy.stale_after())
                .unwrap_or_else(|_| chrono::Duration::zero());
        let stale = db::stale_transactions(&self.db, cutoff).await?;
        metrics::set_stale_transactions(stale.len());

        if stale.is_empty() {
            debug!("no stale transactions");
            return Ok(());
        }

        for tx in stale {
            if !self.reported.insert(tx.id) {
                continue;
            }
            let age_secs = (Utc::now() - tx.created_at).num_seconds();
            tracing::warn!(
                tx_id = tx.id,
                status = %tx.status,
                age_secs,
                "transaction stuck in non-terminal state"
            );
            self.monitor
                .record(EventDetails::StaleTransaction {
                    transaction_id: tx.id,
                    status: tx.status,
                    age_secs,
                })
                .await?;
        }

        Ok(())
    }
}
