use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::TokenType;
use crate::Error;

pub const AUTH_TOKEN_ENV: &str = "BRIDGE_DESTINATION_AUTH_TOKEN";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_id")]
    pub id: String,
    #[serde(default = "default_source_adapter")]
    pub adapter_type: String,
    pub rpc_url: String,
    pub bridge_address: String,
    /// 发送 `markMessageProcessed` 的账户，由节点负责签名
    pub relayer_address: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_replay_window")]
    pub replay_window: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_true")]
    pub skip_processed: bool,
    /// 起始扫描区块，设置后不再使用回放窗口
    #[serde(default)]
    pub start_block: Option<u64>,
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct DestinationConfig {
    #[serde(default = "default_destination_id")]
    pub id: String,
    #[serde(default = "default_destination_adapter")]
    pub adapter_type: String,
    pub rpc_url: String,
    pub canister_id: String,
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    #[serde(default = "default_amount")]
    pub amount: u64,
    #[serde(default)]
    pub token: TokenType,
    #[serde(default = "default_safety_deposit")]
    pub safety_deposit: u64,
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("id", &self.id)
            .field("adapter_type", &self.adapter_type)
            .field("rpc_url", &self.rpc_url)
            .field("canister_id", &self.canister_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("amount", &self.amount)
            .field("token", &self.token)
            .field("safety_deposit", &self.safety_deposit)
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// 每条消息的投递次数上限，包含首次投递
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            channel_capacity: default_channel_capacity(),
            metrics_interval_secs: default_metrics_interval_secs(),
            state_path: None,
        }
    }
}

impl RelayerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// 读取配置文件（`.toml` 后缀按 TOML 解析，否则按 JSON），应用环境变量覆盖后验证
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let config_path = config_path.as_ref();
        let mut config: Config = parse_file(config_path)?;

        config.apply_env_overrides();
        config.validate()?;
        info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    }

    /// 只读取 `logging` 部分，用于在 [`Config::load`] 之前初始化日志。
    /// 文件无法读取时返回默认值，错误由 `load` 报告
    pub fn read_logging<P: AsRef<Path>>(config_path: P) -> LoggingConfig {
        #[derive(Deserialize)]
        struct LoggingOnly {
            #[serde(default)]
            logging: LoggingConfig,
        }

        parse_file::<LoggingOnly>(config_path.as_ref())
            .map(|section| section.logging)
            .unwrap_or_default()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
            if !token.is_empty() {
                debug!("Using destination auth token from {}", AUTH_TOKEN_ENV);
                self.destination.auth_token = Some(token);
            }
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.source.adapter_type != "evm" {
            return Err(Error::Config(format!(
                "Invalid source adapter type: {}",
                self.source.adapter_type
            )));
        }
        if self.destination.adapter_type != "intent_gateway" {
            return Err(Error::Config(format!(
                "Invalid destination adapter type: {}",
                self.destination.adapter_type
            )));
        }

        for (name, url) in [
            ("source.rpc_url", &self.source.rpc_url),
            ("destination.rpc_url", &self.destination.rpc_url),
        ] {
            reqwest::Url::parse(url)
                .map_err(|e| Error::Config(format!("Invalid {}: {}", name, e)))?;
        }

        for (name, address) in [
            ("source.bridge_address", &self.source.bridge_address),
            ("source.relayer_address", &self.source.relayer_address),
        ] {
            if !is_evm_address(address) {
                return Err(Error::Config(format!("Invalid {}: {}", name, address)));
            }
        }

        if self.destination.canister_id.trim().is_empty() {
            return Err(Error::Config("destination.canister_id must not be empty".to_string()));
        }

        let non_zero = [
            ("source.poll_interval_ms", self.source.poll_interval_ms),
            ("source.max_block_range", self.source.max_block_range),
            ("relayer.max_retries", self.relayer.max_retries as u64),
            ("relayer.retry_delay_ms", self.relayer.retry_delay_ms),
            ("relayer.rpc_timeout_ms", self.relayer.rpc_timeout_ms),
            ("relayer.channel_capacity", self.relayer.channel_capacity as u64),
            ("relayer.metrics_interval_secs", self.relayer.metrics_interval_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        Ok(())
    }

    /// 可通过 HTTP 暴露的配置，不含令牌和 URL 凭据
    pub fn sanitized(&self) -> serde_json::Value {
        serde_json::json!({
            "source": {
                "id": self.source.id,
                "adapterType": self.source.adapter_type,
                "rpcUrl": redact_url(&self.source.rpc_url),
                "bridgeAddress": self.source.bridge_address,
                "relayerAddress": self.source.relayer_address,
                "confirmations": self.source.confirmations,
                "replayWindow": self.source.replay_window,
                "pollIntervalMs": self.source.poll_interval_ms,
                "gas": {
                    "gasLimit": self.source.gas_limit,
                    "maxGasPriceGwei": self.source.max_gas_price_gwei,
                },
            },
            "destination": {
                "id": self.destination.id,
                "adapterType": self.destination.adapter_type,
                "rpcUrl": redact_url(&self.destination.rpc_url),
                "canisterId": self.destination.canister_id,
                "amount": self.destination.amount,
                "token": self.destination.token,
                "safetyDeposit": self.destination.safety_deposit,
            },
            "relayer": {
                "name": self.relayer.name,
                "maxRetries": self.relayer.max_retries,
                "retryDelayMs": self.relayer.retry_delay_ms,
                "rpcTimeoutMs": self.relayer.rpc_timeout_ms,
                "metricsIntervalSecs": self.relayer.metrics_interval_secs,
                "persistent": self.relayer.state_path.is_some(),
                "healthCheckPort": self.api.port,
            },
        })
    }
}

/// 去掉 URL 中的用户信息、查询参数和片段，无法解析时整体隐藏
pub fn redact_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => "<redacted>".to_string(),
    }
}

pub fn is_evm_address(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn default_source_id() -> String {
    "ethereum".to_string()
}
fn default_source_adapter() -> String {
    "evm".to_string()
}
fn default_confirmations() -> u64 {
    1
}
fn default_replay_window() -> u64 {
    1000
}
fn default_max_block_range() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_gas_limit() -> u64 {
    300_000
}
fn default_max_gas_price_gwei() -> u64 {
    50
}
fn default_true() -> bool {
    true
}
fn default_destination_id() -> String {
    "icp".to_string()
}
fn default_destination_adapter() -> String {
    "intent_gateway".to_string()
}
fn default_amount() -> u64 {
    1_000_000
}
fn default_safety_deposit() -> u64 {
    50_000
}
fn default_name() -> String {
    "cross-chain-relayer".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_rpc_timeout_ms() -> u64 {
    30_000
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_metrics_interval_secs() -> u64 {
    60
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}

fn parse_file<T: DeserializeOwned>(config_path: &Path) -> Result<T, Error> {
    let config_str = std::fs::read_to_string(config_path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

    let is_toml = config_path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        toml::from_str(&config_str)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    } else {
        serde_json::from_str(&config_str)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }
}
