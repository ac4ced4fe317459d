use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_program::program_pack::Pack;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use spl_token::state::{Account as TokenAccount, Mint};

use crate::error::AppError;
use crate::oracle::{BalanceCheck, BalanceOracle};

pub const TOKEN_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

fn associated_token_address(wallet: &Pubkey, mint: &Pubkey) -> Pubkey {
    let seeds = &[wallet.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()];
    Pubkey::find_program_address(seeds, &ASSOCIATED_TOKEN_PROGRAM_ID).0
}

/// Verifies committed supplies against on-chain token balances.
pub struct RpcBalanceOracle {
    rpc_client: Arc<RpcClient>,
    op_timeout: Duration,
}

impl RpcBalanceOracle {
    pub fn new(rpc_url: &str, op_timeout: Duration) -> Self {
        Self {
            rpc_client: Arc::new(RpcClient::new(rpc_url.to_string())),
            op_timeout,
        }
    }

    async fn mint_decimals(&self, mint: &Pubkey) -> Result<u8, AppError> {
        let account = tokio::time::timeout(self.op_timeout, self.rpc_client.get_account(mint))
            .await
            .map_err(|_| AppError::TimeoutError("mint account fetch".to_string()))??;

        let mint_state = Mint::unpack(&account.data)
            .map_err(|e| AppError::TokenAccountError(format!("failed to unpack mint: {}", e)))?;
        Ok(mint_state.decimals)
    }

    async fn token_balance_raw(&self, wallet: &Pubkey, mint: &Pubkey) -> Result<u64, AppError> {
        let ata = associated_token_address(wallet, mint);
        let response = tokio::time::timeout(
            self.op_timeout,
            self.rpc_client
                .get_account_with_commitment(&ata, CommitmentConfig::confirmed()),
        )
        .await
        .map_err(|_| AppError::TimeoutError("token account fetch".to_string()))??;

        // A wallet that never held the token has no associated account.
        let Some(account) = response.value else {
            return Ok(0);
        };

        let token_account = TokenAccount::unpack(&account.data).map_err(|e| {
            AppError::TokenAccountError(format!("failed to unpack token account: {}", e))
        })?;
        Ok(token_account.amount)
    }
}

#[async_trait]
impl BalanceOracle for RpcBalanceOracle {
    async fn check_balance(
        &self,
        mint: &str,
        wallet: &str,
        required_amount: f64,
    ) -> Result<BalanceCheck, AppError> {
        let mint_pubkey = Pubkey::from_str(mint)?;
        let wallet_pubkey = Pubkey::from_str(wallet)?;

        let decimals = self.mint_decimals(&mint_pubkey).await?;
        let actual_raw = self.token_balance_raw(&wallet_pubkey, &mint_pubkey).await?;

        let required_raw =
            (required_amount.max(0.0) * 10f64.powi(decimals as i32)).round() as u64;

        Ok(BalanceCheck {
            has_enough: actual_raw >= required_raw,
            actual_raw,
            required_raw,
            decimals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_the_canonical_associated_account() {
        let wallet = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let ata = associated_token_address(&wallet, &mint);

        // Deterministic and off-curve, as program-derived addresses are.
        assert_eq!(ata, associated_token_address(&wallet, &mint));
        assert!(!ata.is_on_curve());
        assert_ne!(ata, wallet);
    }
}
