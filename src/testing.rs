//! Test doubles for the external-chain adapter
//!
//! Compiled into the library so both unit tests and the integration suite
//! can script chain behavior without a running gateway.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use eyre::{eyre, Result};

use crate::adapter::{BurnVerification, ExternalChainAdapter, MintReceipt};

#[derive(Debug, Default)]
struct MockState {
    /// Scripted burn verifications keyed by tx hash
    burns: HashMap<String, BurnVerification>,
    /// Mint submissions that should fail before succeeding (u32::MAX = always)
    mint_failures_remaining: u32,
    mint_calls: u64,
    verify_calls: u64,
}

/// Programmable adapter double
#[derive(Debug, Default)]
pub struct MockChainAdapter {
    state: Mutex<MockState>,
}

impl MockChainAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a confirmed burn of `amount` for `tx_hash`
    pub fn confirm_burn(&self, tx_hash: &str, amount: &str) {
        let mut state = self.state.lock().expect("mock lock poisoned");
        state.burns.insert(
            tx_hash.to_string(),
            BurnVerification {
                amount: amount.parse().expect("valid decimal"),
                confirmed: true,
            },
        );
    }

    /// Script an unconfirmed burn (exists but not final)
    pub fn unconfirmed_burn(&self, tx_hash: &str, amount: &str) {
        let mut state = self.state.lock().expect("mock lock poisoned");
        state.burns.insert(
            tx_hash.to_string(),
            BurnVerification {
                amount: amount.parse().expect("valid decimal"),
                confirmed: false,
            },
        );
    }

    /// Make the next `n` mint submissions fail
    pub fn fail_next_mints(&self, n: u32) {
        self.state.lock().expect("mock lock poisoned").mint_failures_remaining = n;
    }

    /// Make every mint submission fail
    pub fn fail_all_mints(&self) {
        self.state.lock().expect("mock lock poisoned").mint_failures_remaining = u32::MAX;
    }

    pub fn mint_calls(&self) -> u64 {
        self.state.lock().expect("mock lock poisoned").mint_calls
    }

    pub fn verify_calls(&self) -> u64 {
        self.state.lock().expect("mock lock poisoned").verify_calls
    }
}

#[async_trait]
impl ExternalChainAdapter for MockChainAdapter {
    async fn verify_burn(
        &self,
        _chain_code: &str,
        tx_hash: &str,
        _min_amount: &BigDecimal,
    ) -> Result<BurnVerification> {
        let mut state = self.state.lock().expect("mock lock poisoned");
        state.verify_calls += 1;
        Ok(state.burns.get(tx_hash).cloned().unwrap_or(BurnVerification {
            amount: BigDecimal::from(0),
            confirmed: false,
        }))
    }

    async fn submit_mint(
        &self,
        chain_code: &str,
        _address: &str,
        _amount: &BigDecimal,
    ) -> Result<MintReceipt> {
        let mut state = self.state.lock().expect("mock lock poisoned");
        state.mint_calls += 1;
        if state.mint_failures_remaining > 0 {
            if state.mint_failures_remaining != u32::MAX {
                state.mint_failures_remaining -= 1;
            }
            return Err(eyre!("mint rejected by {} gateway", chain_code));
        }
        Ok(MintReceipt {
            tx_hash: format!("0xmint{:016x}", state.mint_calls),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_scripts_burns_and_mints() {
        let adapter = MockChainAdapter::new();
        adapter.confirm_burn("0xburn1", "25");
        adapter.fail_next_mints(1);

        let burn = adapter
            .verify_burn("POLYGON", "0xburn1", &BigDecimal::from(10))
            .await
            .unwrap();
        assert!(burn.confirmed);
        assert_eq!(burn.amount, BigDecimal::from(25));

        let unknown = adapter
            .verify_burn("POLYGON", "0xnope", &BigDecimal::from(10))
            .await
            .unwrap();
        assert!(!unknown.confirmed);

        let first = adapter
            .submit_mint("POLYGON", "0xabc", &BigDecimal::from(10))
            .await;
        assert!(first.is_err());
        let second = adapter
            .submit_mint("POLYGON", "0xabc", &BigDecimal::from(10))
            .await
            .unwrap();
        assert!(second.tx_hash.starts_with("0xmint"));
        assert_eq!(adapter.mint_calls(), 2);
    }
}
