//! Chain registry
//!
//! Supported-chain policy (minimum amount, fee) lives in Postgres and is
//! loaded into an immutable in-memory snapshot at startup, so request-time
//! lookups never round-trip to storage. Admins edit the table out of band
//! and restart or redeploy; a chain's policy is immutable at request time.

use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;

use crate::db;
use crate::error::BridgeError;

/// A supported external chain with its bridge policy
#[derive(Debug, Clone, Serialize)]
pub struct SupportedChain {
    pub chain_code: String,
    pub display_name: String,
    pub min_amount: BigDecimal,
    pub fee: BigDecimal,
}

/// Read-only snapshot of the supported-chain table
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<String, SupportedChain>,
}

impl ChainRegistry {
    /// Load the registry from storage, validating every row's policy
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let rows = db::supported_chains(pool).await?;
        let mut chains = Vec::with_capacity(rows.len());
        for row in rows {
            let min_amount = BigDecimal::from_str(&row.min_amount).wrap_err_with(|| {
                format!("invalid min_amount for chain {}", row.chain_code)
            })?;
            let fee = BigDecimal::from_str(&row.fee)
                .wrap_err_with(|| format!("invalid fee for chain {}", row.chain_code))?;
            chains.push(SupportedChain {
                chain_code: row.chain_code,
                display_name: row.display_name,
                min_amount,
                fee,
            });
        }
        Self::from_chains(chains)
    }

    /// Build a registry from already-resolved chains (startup and tests)
    pub fn from_chains(chains: Vec<SupportedChain>) -> Result<Self> {
        let zero = BigDecimal::from(0);
        let mut map = HashMap::with_capacity(chains.len());
        for chain in chains {
            if chain.min_amount <= zero {
                return Err(eyre!(
                    "chain {} has non-positive min_amount {}",
                    chain.chain_code,
                    chain.min_amount
                ));
            }
            if chain.fee < zero {
                return Err(eyre!(
                    "chain {} has negative fee {}",
                    chain.chain_code,
                    chain.fee
                ));
            }
            if map.insert(chain.chain_code.clone(), chain).is_some() {
                return Err(eyre!("duplicate chain_code in registry"));
            }
        }
        Ok(Self { chains: map })
    }

    /// Resolve a chain's policy. Pure read, no side effects.
    pub fn lookup(&self, chain_code: &str) -> Result<&SupportedChain, BridgeError> {
        self.chains
            .get(chain_code)
            .ok_or_else(|| BridgeError::UnsupportedChain {
                chain_code: chain_code.to_string(),
            })
    }

    /// All supported chains, sorted by code for a stable listing
    pub fn all(&self) -> Vec<&SupportedChain> {
        let mut chains: Vec<_> = self.chains.values().collect();
        chains.sort_by(|a, b| a.chain_code.cmp(&b.chain_code));
        chains
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_chain(code: &str, min_amount: &str, fee: &str) -> SupportedChain {
    SupportedChain {
        chain_code: code.to_string(),
        display_name: format!("{code} test"),
        min_amount: BigDecimal::from_str(min_amount).unwrap(),
        fee: BigDecimal::from_str(fee).unwrap(),
    }
}
