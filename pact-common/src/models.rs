use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    MarketCap,
    TimeExpired,
    Manual,
    AllBroken,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Contract {
    pub id: i64,
    pub mint: String,
    pub condition1: f64,
    pub condition2: DateTime<Utc>,
    pub is_completed: bool,
    pub completion_reason: Option<CompletionReason>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a single user's stake in a contract. Transitions are
/// one-way: a row leaves `InProgress` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserContractStatus {
    InProgress,
    CompletedCondition1,
    CompletedCondition2,
    Broken,
}

impl UserContractStatus {
    pub fn code(self) -> i16 {
        match self {
            UserContractStatus::InProgress => 0,
            UserContractStatus::CompletedCondition1 => 1,
            UserContractStatus::CompletedCondition2 => 2,
            UserContractStatus::Broken => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(UserContractStatus::InProgress),
            1 => Some(UserContractStatus::CompletedCondition1),
            2 => Some(UserContractStatus::CompletedCondition2),
            3 => Some(UserContractStatus::Broken),
            _ => None,
        }
    }
}

impl Serialize for UserContractStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.code())
    }
}

impl<'de> Deserialize<'de> for UserContractStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        UserContractStatus::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status code {}", code)))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserContract {
    pub contract_id: i64,
    pub user_address: String,
    pub supply: f64,
    pub status: UserContractStatus,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub wallet_address: String,
    /// Raw (un-asymptoted) score. Display scores are derived on read.
    pub score: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Buy,
    Sell,
}

/// One decoded trade frame from the upstream feed.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    #[serde(default)]
    pub signature: String,
    pub mint: String,
    pub trader_public_key: String,
    pub tx_type: TxType,
    #[serde(default)]
    pub token_amount: f64,
    #[serde(default)]
    pub sol_amount: f64,
    pub new_token_balance: f64,
    #[serde(default)]
    pub v_tokens_in_bonding_curve: f64,
    #[serde(default)]
    pub v_sol_in_bonding_curve: f64,
    pub market_cap_sol: f64,
    #[serde(default)]
    pub pool: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Read-only view of one active stream, safe to hand to operators.
#[derive(Debug, Serialize, Clone)]
pub struct StreamSnapshot {
    pub contract_id: i64,
    pub mint: String,
    pub started_at: DateTime<Utc>,
    pub signers: Vec<String>,
    pub condition1: f64,
    pub condition2: DateTime<Utc>,
    pub ath_market_cap_sol: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct HealthReport {
    pub ready: bool,
    pub active_streams: usize,
    pub feed: ConnectionStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContractEventData {
    pub contract_id: i64,
    pub mint: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContractCreatedNotification {
    pub data: ContractEventData,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContractDeletedNotification {
    pub data: ContractEventData,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamStopEventData {
    pub contract_id: i64,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamStoppedNotification {
    pub data: StreamStopEventData,
    #[serde(rename = "type")]
    pub type_: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_event_decodes_camel_case_frame() {
        let frame = r#"{
            "signature": "5xyz",
            "mint": "So11111111111111111111111111111111111111112",
            "traderPublicKey": "7abc",
            "txType": "buy",
            "tokenAmount": 1500.0,
            "solAmount": 0.25,
            "newTokenBalance": 1500.0,
            "vTokensInBondingCurve": 1000000.0,
            "vSolInBondingCurve": 30.0,
            "marketCapSol": 42.5,
            "pool": "pump"
        }"#;

        let event: TradeEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(event.trader_public_key, "7abc");
        assert_eq!(event.tx_type, TxType::Buy);
        assert_eq!(event.market_cap_sol, 42.5);
        assert_eq!(event.pool.as_deref(), Some("pump"));
    }

    #[test]
    fn status_round_trips_as_integer_code() {
        let json = serde_json::to_string(&UserContractStatus::Broken).unwrap();
        assert_eq!(json, "3");
        let back: UserContractStatus = serde_json::from_str("1").unwrap();
        assert_eq!(back, UserContractStatus::CompletedCondition1);
        assert!(serde_json::from_str::<UserContractStatus>("9").is_err());
    }
}
