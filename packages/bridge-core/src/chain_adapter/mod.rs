use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::{DestinationConfig, SourceConfig},
    types::{CreateIntentRequest, Intent, LedgerHealth, LockEvent, Receipt},
    Error,
};

/// 源链适配器特征：监听锁定事件，并在目标链处理完成后回写已处理标记
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceLedger: Send + Sync {
    /// 获取节点当前的最新区块高度
    async fn current_height(&self) -> Result<u64, Error>;

    /// 按发出顺序返回闭区间内的锁定事件
    async fn lock_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LockEvent>, Error>;

    /// 查询链上记录是否已将 `id` 标记为已处理
    async fn is_processed(&self, id: &str) -> Result<bool, Error>;

    /// 将 `id` 标记为已处理
    async fn acknowledge_processed(&self, id: &str) -> Result<Receipt, Error>;

    async fn health(&self) -> LedgerHealth;
}

/// 目标链适配器特征：查询和创建 intent
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DestinationLedger: Send + Sync {
    async fn query_intent(&self, id: &str) -> Result<Option<Intent>, Error>;

    /// 返回目标链上新建 intent 的 id
    async fn create_intent(&self, request: &CreateIntentRequest) -> Result<String, Error>;

    async fn health(&self) -> LedgerHealth;
}

pub mod evm;
pub mod intent_gateway;

pub use evm::EvmSourceAdapter;
pub use intent_gateway::IntentGatewayAdapter;

/// 按 `config.adapter_type` 创建源链适配器，每个请求受 `rpc_timeout` 限制
pub fn connect_source(
    config: &SourceConfig,
    rpc_timeout: Duration,
) -> Result<Arc<dyn SourceLedger>, Error> {
    match config.adapter_type.as_str() {
        "evm" => Ok(Arc::new(EvmSourceAdapter::new(config.clone(), rpc_timeout)?)),
        other => Err(Error::Config(format!("Unsupported source adapter type: {}", other))),
    }
}

/// 按 `config.adapter_type` 创建目标链适配器
pub fn connect_destination(
    config: &DestinationConfig,
    rpc_timeout: Duration,
) -> Result<Arc<dyn DestinationLedger>, Error> {
    match config.adapter_type.as_str() {
        "intent_gateway" => Ok(Arc::new(IntentGatewayAdapter::new(
            config.clone(),
            rpc_timeout,
        )?)),
        other => Err(Error::Config(format!(
            "Unsupported destination adapter type: {}",
            other
        ))),
    }
}
