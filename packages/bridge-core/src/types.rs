use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Error;

/// 规范化后的跨链消息，`id` 为幂等键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossChainMessage {
    pub id: String,
    pub source_chain: String,
    pub target_chain: String,
    pub target_identity: String,
    pub receiver: String,
    pub hashlock: String,
    /// 过期时间（Unix 秒）
    pub timelock: u64,
    pub timestamp: u64,
    pub source_block_number: u64,
    pub source_tx_hash: String,
}

/// 源链解码出的原始锁定事件，数值字段保留为 256 位大端字
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEvent {
    pub swap_id: [u8; 32],
    pub source_chain: String,
    pub target_chain: String,
    pub target_identity: String,
    pub receiver: String,
    pub hashlock: [u8; 32],
    pub timelock: [u8; 32],
    pub timestamp: [u8; 32],
    /// 尚未打包的日志为 `None`
    pub block_number: Option<u64>,
    pub tx_hash: Option<String>,
}

impl TryFrom<LockEvent> for CrossChainMessage {
    type Error = Error;

    fn try_from(event: LockEvent) -> Result<Self, Self::Error> {
        let id = format!("0x{}", hex::encode(event.swap_id));
        let timelock = word_to_u64(&event.timelock)
            .ok_or_else(|| Error::MalformedEvent(format!("{}: timelock exceeds u64", id)))?;
        let timestamp = word_to_u64(&event.timestamp)
            .ok_or_else(|| Error::MalformedEvent(format!("{}: timestamp exceeds u64", id)))?;
        let source_block_number = event
            .block_number
            .ok_or_else(|| Error::MalformedEvent(format!("{}: missing block number", id)))?;
        let source_tx_hash = event
            .tx_hash
            .ok_or_else(|| Error::MalformedEvent(format!("{}: missing transaction hash", id)))?;

        Ok(Self {
            id,
            source_chain: event.source_chain,
            target_chain: event.target_chain,
            target_identity: event.target_identity,
            receiver: event.receiver,
            hashlock: format!("0x{}", hex::encode(event.hashlock)),
            timelock,
            timestamp,
            source_block_number,
            source_tx_hash,
        })
    }
}

/// Interprets a big-endian 256-bit word as `u64`, or `None` if it does not fit.
pub fn word_to_u64(word: &[u8; 32]) -> Option<u64> {
    if word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[24..]);
    Some(u64::from_be_bytes(low))
}

/// 等待重新投递的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub message: CrossChainMessage,
    /// 已失败的重试次数，不含首次投递
    pub attempts: u32,
    pub last_error: String,
    /// Unix 毫秒
    pub next_retry_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    #[default]
    #[serde(rename = "ICP")]
    Icp,
    #[serde(rename = "ICRC1")]
    Icrc1(String),
}

/// 目标链上的 intent 记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub swap_id: String,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub hashlock: Option<String>,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    pub swap_id: String,
    pub receiver: String,
    pub amount: u64,
    pub token: TokenType,
    pub hashlock: String,
    pub origin_address: String,
    pub timeout_hours: u64,
    pub safety_deposit: u64,
}

/// Confirmation of the source-side "mark processed" operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerHealth {
    pub connected: bool,
    pub chain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canister_id: Option<String>,
    /// Ledger-specific counters, e.g. swap totals from the intent canister.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

impl LedgerHealth {
    pub fn up(chain_id: &str, block_number: Option<u64>) -> Self {
        Self {
            connected: true,
            chain_id: chain_id.to_string(),
            block_number,
            ..Self::default()
        }
    }

    pub fn down(chain_id: &str, error: impl ToString) -> Self {
        Self {
            connected: false,
            chain_id: chain_id.to_string(),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// 单次处理后消息所处的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Rejected(String),
    Deduplicated,
    /// 已有重试记录，由重试调度负责投递
    RetryPending,
    /// 同一 id 正在投递中
    InFlight,
    Completed,
    Retrying { next_retry_at: u64 },
    Dropped { last_error: String },
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
