//! Bridge orchestrator
//!
//! Entry point for lock and unlock requests. Gates run cheapest-first:
//! circuit breaker, then blacklist, then chain registry and minimum amount —
//! all before any ledger mutation. Custody mutations are delegated to the
//! storage layer's transactional functions; external-chain calls are bounded
//! by a timeout and never hold any lock.

use std::sync::Arc;
use std::time::Instant;

use bigdecimal::BigDecimal;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::adapter::ExternalChainAdapter;
use crate::blacklist::{BlacklistEnforcer, BlacklistMatch, BlacklistSnapshot};
use crate::breaker::CircuitBreaker;
use crate::config::{AdapterConfig, PolicyConfig};
use crate::db::{self, BridgeTransaction, LockCreateOutcome, NewBridgeTransaction, UnlockCreateOutcome};
use crate::error::BridgeError;
use crate::metrics;
use crate::monitor::{EventDetails, SecurityMonitor};
use crate::registry::{ChainRegistry, SupportedChain};
use crate::retry::{self, RetryConfig};
use crate::types::Direction;

/// A user-initiated lock: internal balance into custody, wrapped asset
/// minted externally
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub user_id: String,
    pub chain_code: String,
    pub amount: BigDecimal,
    pub external_address: String,
}

/// A user-initiated unlock: claimed external burn, internal balance released
#[derive(Debug, Clone)]
pub struct UnlockRequest {
    pub user_id: String,
    pub chain_code: String,
    pub amount: BigDecimal,
    pub external_tx_hash: String,
}

/// A rejection from the synchronous validation pipeline, before any ledger
/// mutation. Kept separate from [`BridgeError`] so the caller still sees the
/// matched blacklist entry for event emission.
#[derive(Debug)]
pub enum Rejection {
    CircuitBreakerOpen(String),
    Blacklisted(BlacklistMatch),
    UnsupportedChain(String),
    BelowMinimumAmount {
        chain_code: String,
        minimum: BigDecimal,
        fee: BigDecimal,
    },
}

impl From<Rejection> for BridgeError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::CircuitBreakerOpen(reason) => BridgeError::CircuitBreakerOpen { reason },
            Rejection::Blacklisted(hit) => BridgeError::Blacklisted { reason: hit.reason },
            Rejection::UnsupportedChain(chain_code) => {
                BridgeError::UnsupportedChain { chain_code }
            }
            Rejection::BelowMinimumAmount {
                chain_code,
                minimum,
                fee,
            } => BridgeError::BelowMinimumAmount {
                chain_code,
                minimum,
                fee,
            },
        }
    }
}

/// The synchronous validation pipeline. Order matters: the breaker is the
/// cheapest and most urgent check, the blacklist next, the registry last.
pub fn validate_request<'r>(
    breaker: &CircuitBreaker,
    blacklist: &BlacklistSnapshot,
    registry: &'r ChainRegistry,
    user_did: &str,
    external_address: Option<&str>,
    chain_code: &str,
    amount: &BigDecimal,
) -> Result<&'r SupportedChain, Rejection> {
    if breaker.is_open() {
        let reason = breaker.reason().unwrap_or_else(|| "unspecified".to_string());
        return Err(Rejection::CircuitBreakerOpen(reason));
    }

    if let Some(hit) = blacklist.check(Some(user_did), external_address) {
        return Err(Rejection::Blacklisted(hit));
    }

    let chain = match registry.lookup(chain_code) {
        Ok(chain) => chain,
        Err(_) => return Err(Rejection::UnsupportedChain(chain_code.to_string())),
    };

    if *amount < chain.min_amount {
        return Err(Rejection::BelowMinimumAmount {
            chain_code: chain.chain_code.clone(),
            minimum: chain.min_amount.clone(),
            fee: chain.fee.clone(),
        });
    }

    Ok(chain)
}

/// The orchestrator. All collaborators are injected; tests construct a fresh
/// set per case.
pub struct BridgeOrchestrator {
    db: PgPool,
    registry: Arc<ChainRegistry>,
    blacklist: Arc<BlacklistEnforcer>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<SecurityMonitor>,
    adapter: Arc<dyn ExternalChainAdapter>,
    adapter_config: AdapterConfig,
    policy: PolicyConfig,
}

impl BridgeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        registry: Arc<ChainRegistry>,
        blacklist: Arc<BlacklistEnforcer>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<SecurityMonitor>,
        adapter: Arc<dyn ExternalChainAdapter>,
        adapter_config: AdapterConfig,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            db,
            registry,
            blacklist,
            breaker,
            monitor,
            adapter,
            adapter_config,
            policy,
        }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Lock `amount` for minting on `chain_code`. Debits `amount + fee`
    /// atomically with the pending row; a failed mint refunds the debit.
    pub async fn lock(&self, req: LockRequest) -> Result<BridgeTransaction, BridgeError> {
        let result = self.lock_inner(req).await;
        match &result {
            Ok(_) => metrics::record_request("lock", "success"),
            Err(e) => {
                metrics::record_rejection(e.code());
                metrics::record_request("lock", "rejected");
            }
        }
        result
    }

    async fn lock_inner(&self, req: LockRequest) -> Result<BridgeTransaction, BridgeError> {
        if req.amount <= BigDecimal::from(0) {
            return Err(BridgeError::InvalidRequest("amount must be positive".into()));
        }
        if req.external_address.trim().is_empty() {
            return Err(BridgeError::InvalidRequest(
                "external_address is required".into(),
            ));
        }

        let chain = self.gate(&req.user_id, Some(&req.external_address), &req.chain_code, &req.amount).await?;

        let new_tx = NewBridgeTransaction {
            user_id: req.user_id.clone(),
            direction: Direction::Lock,
            chain_code: chain.chain_code.clone(),
            amount: req.amount.to_string(),
            external_address: Some(req.external_address.clone()),
            external_tx_hash: None,
        };
        let fee = chain.fee.to_string();

        let storage_retry = RetryConfig::with_max_retries(self.policy.storage_retry_attempts);
        let outcome = retry::with_retry(&storage_retry, |_| {
            db::create_lock_transaction(&self.db, &new_tx, &fee)
        })
        .await?;

        let tx = match outcome {
            LockCreateOutcome::Created(tx) => tx,
            LockCreateOutcome::InsufficientBalance => {
                return Err(BridgeError::InsufficientBalance {
                    required: &req.amount + &chain.fee,
                });
            }
        };

        info!(
            tx_id = tx.id,
            user_id = %tx.user_id,
            chain = %tx.chain_code,
            amount = %tx.amount,
            fee = %tx.fee,
            "lock accepted, balance debited"
        );

        // The debit is durable; the engine has custody.
        if !db::mark_locked(&self.db, tx.id).await? {
            return Err(BridgeError::InvalidStateTransition {
                from: tx.status,
                to: crate::types::TxStatus::Locked,
            });
        }

        let started = Instant::now();
        let mint = tokio::time::timeout(
            self.adapter_config.timeout(),
            self.adapter
                .submit_mint(&chain.chain_code, &req.external_address, &req.amount),
        )
        .await;
        metrics::observe_adapter_latency("submit_mint", started.elapsed().as_secs_f64());

        let detail = match mint {
            Ok(Ok(receipt)) => {
                if !db::mark_minted(&self.db, tx.id, &receipt.tx_hash).await? {
                    return Err(BridgeError::InvalidStateTransition {
                        from: crate::types::TxStatus::Locked,
                        to: crate::types::TxStatus::Minted,
                    });
                }
                info!(tx_id = tx.id, mint_tx = %receipt.tx_hash, "mint submitted, lock complete");
                let final_tx = db::get_transaction(&self.db, tx.id)
                    .await?
                    .ok_or(BridgeError::StorageConflict)?;
                return Ok(final_tx);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "mint submission timed out after {}s",
                self.adapter_config.timeout_secs
            ),
        };

        warn!(tx_id = tx.id, detail = %detail, "mint failed, starting refund sequence");
        self.refund_failed_lock(&tx, &detail).await;

        self.record_event(EventDetails::MintFailed {
            user_id: tx.user_id.clone(),
            chain_code: tx.chain_code.clone(),
            transaction_id: tx.id,
            detail: detail.clone(),
        })
        .await;

        Err(BridgeError::MintSubmissionFailed { detail })
    }

    /// Reverse the debit of a lock whose mint never happened. Leaving the
    /// funds debited with no mint is a fund-loss bug, so exhausting the
    /// retry budget escalates a CRITICAL event for an operator page.
    async fn refund_failed_lock(&self, tx: &BridgeTransaction, detail: &str) {
        let reason = format!("MintSubmissionFailed: {detail}");
        let refund_retry = RetryConfig::with_max_retries(self.policy.refund_retry_attempts);

        let refunded = retry::with_retry(&refund_retry, |_| {
            db::fail_lock_with_refund(&self.db, tx.id, &reason)
        })
        .await;

        match refunded {
            Ok(true) => {
                info!(tx_id = tx.id, "lock failed and debit refunded");
            }
            Ok(false) => {
                // Row already terminal; a concurrent driver finished the job.
                warn!(tx_id = tx.id, "refund skipped, transaction already terminal");
            }
            Err(e) => {
                error!(tx_id = tx.id, error = %e, "REFUND FAILED after retries, operator action required");
                metrics::record_refund_failure();
                self.record_event(EventDetails::RefundFailed {
                    user_id: tx.user_id.clone(),
                    transaction_id: tx.id,
                    amount: tx.amount.clone(),
                })
                .await;
            }
        }
    }

    /// Release `amount` against a claimed burn on `chain_code`. The burn
    /// hash can only ever be consumed once; the storage constraint is the
    /// arbiter under concurrency.
    pub async fn unlock(&self, req: UnlockRequest) -> Result<BridgeTransaction, BridgeError> {
        let result = self.unlock_inner(req).await;
        match &result {
            Ok(_) => metrics::record_request("unlock", "success"),
            Err(e) => {
                metrics::record_rejection(e.code());
                metrics::record_request("unlock", "rejected");
            }
        }
        result
    }

    async fn unlock_inner(&self, req: UnlockRequest) -> Result<BridgeTransaction, BridgeError> {
        if req.amount <= BigDecimal::from(0) {
            return Err(BridgeError::InvalidRequest("amount must be positive".into()));
        }
        if req.external_tx_hash.trim().is_empty() {
            return Err(BridgeError::InvalidRequest(
                "external_tx_hash is required".into(),
            ));
        }

        let chain = self.gate(&req.user_id, None, &req.chain_code, &req.amount).await?;

        let new_tx = NewBridgeTransaction {
            user_id: req.user_id.clone(),
            direction: Direction::Unlock,
            chain_code: chain.chain_code.clone(),
            amount: req.amount.to_string(),
            external_address: None,
            external_tx_hash: Some(req.external_tx_hash.clone()),
        };

        let tx = match db::create_unlock_transaction(&self.db, &new_tx).await? {
            UnlockCreateOutcome::Created(tx) => tx,
            UnlockCreateOutcome::DuplicateTxHash => {
                if let Err(e) =
                    db::insert_failed_unlock_audit(&self.db, &new_tx, "DuplicateTxHash").await
                {
                    error!(error = %e, "failed to record duplicate-unlock audit row");
                }
                self.record_event(EventDetails::DuplicateTxHash {
                    user_id: req.user_id.clone(),
                    chain_code: chain.chain_code.clone(),
                    tx_hash: req.external_tx_hash.clone(),
                })
                .await;
                return Err(BridgeError::DuplicateTxHash {
                    tx_hash: req.external_tx_hash,
                });
            }
        };

        info!(
            tx_id = tx.id,
            user_id = %tx.user_id,
            chain = %tx.chain_code,
            burn_tx = %req.external_tx_hash,
            "unlock accepted, verifying burn"
        );

        let started = Instant::now();
        let verification = tokio::time::timeout(
            self.adapter_config.timeout(),
            self.adapter
                .verify_burn(&chain.chain_code, &req.external_tx_hash, &req.amount),
        )
        .await;
        metrics::observe_adapter_latency("verify_burn", started.elapsed().as_secs_f64());

        let detail = match verification {
            Ok(Ok(burn)) if burn.confirmed && burn.amount >= req.amount => {
                if !db::mark_verified(&self.db, tx.id).await? {
                    return Err(BridgeError::InvalidStateTransition {
                        from: tx.status,
                        to: crate::types::TxStatus::Verified,
                    });
                }
                if !db::complete_unlock(&self.db, tx.id).await? {
                    return Err(BridgeError::InvalidStateTransition {
                        from: crate::types::TxStatus::Verified,
                        to: crate::types::TxStatus::Unlocked,
                    });
                }
                info!(tx_id = tx.id, "burn verified, balance credited");
                let final_tx = db::get_transaction(&self.db, tx.id)
                    .await?
                    .ok_or(BridgeError::StorageConflict)?;
                return Ok(final_tx);
            }
            Ok(Ok(burn)) if !burn.confirmed => "burn not found or not confirmed".to_string(),
            Ok(Ok(burn)) => format!(
                "burned amount {} is below the claimed amount {}",
                burn.amount, req.amount
            ),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "burn verification timed out after {}s",
                self.adapter_config.timeout_secs
            ),
        };

        let reason = format!("BurnNotVerified: {detail}");
        if !db::fail_unlock(&self.db, tx.id, &reason).await? {
            warn!(tx_id = tx.id, "unlock already terminal while failing");
        }

        self.record_event(EventDetails::BurnNotVerified {
            user_id: req.user_id,
            chain_code: chain.chain_code.clone(),
            tx_hash: req.external_tx_hash,
            detail: detail.clone(),
        })
        .await;

        Err(BridgeError::BurnNotVerified { detail })
    }

    /// Shared gate pipeline; emits the blacklist security event on hit
    async fn gate(
        &self,
        user_did: &str,
        external_address: Option<&str>,
        chain_code: &str,
        amount: &BigDecimal,
    ) -> Result<SupportedChain, BridgeError> {
        let snapshot = self.blacklist.snapshot();
        match validate_request(
            &self.breaker,
            &snapshot,
            &self.registry,
            user_did,
            external_address,
            chain_code,
            amount,
        ) {
            Ok(chain) => Ok(chain.clone()),
            Err(Rejection::Blacklisted(hit)) => {
                warn!(
                    user_id = user_did,
                    matched = %hit.value,
                    "blacklist hit on bridge request"
                );
                self.record_event(EventDetails::BlacklistHit {
                    user_id: user_did.to_string(),
                    entry_type: hit.entry_type,
                    value: hit.value.clone(),
                    reason: hit.reason.clone(),
                })
                .await;
                Err(Rejection::Blacklisted(hit).into())
            }
            Err(rejection) => Err(rejection.into()),
        }
    }

    /// Security events are mandatory but secondary: a failed insert is
    /// logged, never turned into a request failure.
    async fn record_event(&self, details: EventDetails) {
        if let Err(e) = self.monitor.record(details).await {
            error!(error = %e, "failed to record security event");
        }
    }

    pub async fn history(&self, user_id: &str) -> Result<Vec<BridgeTransaction>, BridgeError> {
        Ok(db::history(&self.db, user_id).await?)
    }
}
