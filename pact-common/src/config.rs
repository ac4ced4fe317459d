use std::env;
use std::time::Duration;

use crate::error::AppError;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_OP_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_ws_url: String,
    pub sol_price_url: String,
    pub rpc_url: String,
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub channel_capacity: usize,
    pub op_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            upstream_ws_url: required("UPSTREAM_WS_URL")?,
            sol_price_url: required("SOL_PRICE_URL")?,
            rpc_url: required("RPC_URL")?,
            supabase_url: required("SUPABASE_URL")?,
            supabase_service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
            max_retries: optional_u64("MAX_RETRIES", DEFAULT_MAX_RETRIES as u64)? as u32,
            base_retry_delay: Duration::from_millis(optional_u64(
                "BASE_RETRY_DELAY_MS",
                DEFAULT_BASE_RETRY_DELAY_MS,
            )?),
            channel_capacity: optional_u64("CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY as u64)?
                as usize,
            op_timeout: Duration::from_millis(optional_u64(
                "DEFAULT_OP_TIMEOUT_MS",
                DEFAULT_OP_TIMEOUT_MS,
            )?),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::ConfigError(format!("{} must be set", key)))
}

fn optional_u64(key: &str, default: u64) -> Result<u64, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| AppError::ConfigError(format!("{} must be a number, got {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}
