pub mod api;
pub mod chain_adapter;
pub mod config;
pub mod dedup;
pub mod delivery;
pub mod metrics;
pub mod relayer;
pub mod retry;
pub mod store;
pub mod types;
pub mod validator;
pub mod watcher;

pub use config::Config;
pub use relayer::Relayer;
pub use types::{CrossChainMessage, MessageOutcome, RetryRecord};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out after {timeout_ms}ms during {action}")]
    Timeout { action: &'static str, timeout_ms: u64 },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// 依赖方过慢或不可用导致的错误，稍后重试可能成功
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Chain(_) | Error::Network(_) | Error::Timeout { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// 限制外部调用的耗时，超过 `limit` 返回 [`Error::Timeout`]
pub async fn with_timeout<T, F>(
    action: &'static str,
    limit: std::time::Duration,
    fut: F,
) -> Result<T, Error>
where
    F: std::future::Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            action,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
