//! External-chain adapter
//!
//! The engine treats the external chain as a black box behind a verify/mint
//! interface. The production implementation talks to a chain gateway over
//! HTTP; tests use the programmable double in [`crate::testing`].

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::config::AdapterConfig;

/// Result of checking a claimed burn transaction on the external chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurnVerification {
    /// Amount actually burned, as reported by the chain
    pub amount: BigDecimal,
    /// Whether the burn exists and has enough confirmations
    pub confirmed: bool,
}

/// Receipt for a submitted mint transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintReceipt {
    pub tx_hash: String,
}

/// The verify/mint contract the orchestrator drives. Calls can take seconds;
/// the orchestrator bounds them with a timeout and never holds a lock across
/// them.
#[async_trait]
pub trait ExternalChainAdapter: Send + Sync {
    /// Verify that `tx_hash` is a confirmed burn of at least `min_amount`
    /// on `chain_code`
    async fn verify_burn(
        &self,
        chain_code: &str,
        tx_hash: &str,
        min_amount: &BigDecimal,
    ) -> Result<BurnVerification>;

    /// Submit a mint of `amount` to `address` on `chain_code`
    async fn submit_mint(
        &self,
        chain_code: &str,
        address: &str,
        amount: &BigDecimal,
    ) -> Result<MintReceipt>;
}

#[derive(Serialize)]
struct VerifyBurnRequest<'a> {
    tx_hash: &'a str,
    min_amount: &'a BigDecimal,
}

#[derive(Serialize)]
struct SubmitMintRequest<'a> {
    address: &'a str,
    amount: &'a BigDecimal,
}

/// HTTP implementation against the chain gateway
pub struct HttpChainAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChainAdapter {
    pub fn new(config: &AdapterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .wrap_err("Failed to build chain gateway HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ExternalChainAdapter for HttpChainAdapter {
    async fn verify_burn(
        &self,
        chain_code: &str,
        tx_hash: &str,
        min_amount: &BigDecimal,
    ) -> Result<BurnVerification> {
        let url = format!("{}/chains/{}/verify-burn", self.base_url, chain_code);
        let response = self
            .client
            .post(&url)
            .json(&VerifyBurnRequest { tx_hash, min_amount })
            .send()
            .await
            .wrap_err_with(|| format!("Burn verification request to {} failed", chain_code))?;

        if !response.status().is_success() {
            return Err(eyre!(
                "chain gateway returned {} for burn verification on {}",
                response.status(),
                chain_code
            ));
        }

        response
            .json::<BurnVerification>()
            .await
            .wrap_err("Failed to decode burn verification response")
    }

    async fn submit_mint(
        &self,
        chain_code: &str,
        address: &str,
        amount: &BigDecimal,
    ) -> Result<MintReceipt> {
        let url = format!("{}/chains/{}/mint", self.base_url, chain_code);
        let response = self
            .client
            .post(&url)
            .json(&SubmitMintRequest { address, amount })
            .send()
            .await
            .wrap_err_with(|| format!("Mint submission request to {} failed", chain_code))?;

        if !response.status().is_success() {
            return Err(eyre!(
                "chain gateway returned {} for mint submission on {}",
                response.status(),
                chain_code
            ));
        }

        response
            .json::<MintReceipt>()
            .await
            .wrap_err("Failed to decode mint receipt")
    }
}
