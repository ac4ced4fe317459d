mod balance;
mod sol_price;

use async_trait::async_trait;

pub use balance::RpcBalanceOracle;
pub use sol_price::SolPriceClient;

use crate::error::AppError;

/// Result of a balance verification. Comparison happens in the token's
/// native fixed-point units.
#[derive(Debug, Clone, Copy)]
pub struct BalanceCheck {
    pub has_enough: bool,
    pub actual_raw: u64,
    pub required_raw: u64,
    pub decimals: u8,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current SOL spot price in USD; always finite and positive.
    async fn sol_price_usd(&self) -> Result<f64, AppError>;
}

#[async_trait]
pub trait BalanceOracle: Send + Sync {
    /// Verifies that `wallet` holds at least `required_amount` (human
    /// units) of `mint`. The oracle performs the decimal scaling.
    async fn check_balance(
        &self,
        mint: &str,
        wallet: &str,
        required_amount: f64,
    ) -> Result<BalanceCheck, AppError>;
}
