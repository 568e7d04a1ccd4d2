use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use super::DestinationLedger;
use crate::{
    config::DestinationConfig,
    types::{CreateIntentRequest, Intent, LedgerHealth},
    Error,
};

/// Result variant returned by the intent canister.
#[derive(Debug, Deserialize)]
enum CanisterResult {
    #[serde(rename = "ok")]
    Ok(String),
    #[serde(rename = "err")]
    Err(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapStats {
    pub total_swaps: u64,
    pub pending_swaps: u64,
    pub claimed_swaps: u64,
    pub refunded_swaps: u64,
}

/// Destination ledger reached through a JSON-RPC gateway in front of the
/// intent canister.
pub struct IntentGatewayAdapter {
    client: reqwest::Client,
    config: DestinationConfig,
    request_id: AtomicU64,
}

impl IntentGatewayAdapter {
    pub fn new(config: DestinationConfig, rpc_timeout: Duration) -> Result<Self, Error> {
        reqwest::Url::parse(&config.rpc_url)
            .map_err(|e| Error::Config(format!("Invalid destination rpc_url: {}", e)))?;
        Ok(Self {
            client: reqwest::Client::builder().timeout(rpc_timeout).build()?,
            config,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T, Error> {
        let mut params = vec![json!(self.config.canister_id)];
        params.extend(args);

        let mut request = self.client.post(&self.config.rpc_url).json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        }));
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let result: Value = response.json().await?;
        if let Some(err) = result.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Chain(format!("{} failed: {}", method, err)));
        }
        Ok(serde_json::from_value(
            result.get("result").cloned().unwrap_or(Value::Null),
        )?)
    }

    pub async fn swap_stats(&self) -> Result<SwapStats, Error> {
        self.call("intent_getSwapStats", vec![]).await
    }
}

#[async_trait]
impl DestinationLedger for IntentGatewayAdapter {
    async fn query_intent(&self, id: &str) -> Result<Option<Intent>, Error> {
        self.call("intent_getIntent", vec![json!(id)]).await
    }

    async fn create_intent(&self, request: &CreateIntentRequest) -> Result<String, Error> {
        let result: CanisterResult = self
            .call("intent_createIntent", vec![serde_json::to_value(request)?])
            .await?;
        match result {
            CanisterResult::Ok(intent_id) => {
                info!(swap_id = %request.swap_id, intent_id = %intent_id, "Intent created");
                Ok(intent_id)
            }
            CanisterResult::Err(reason) => {
                Err(Error::Chain(format!("Failed to create intent: {}", reason)))
            }
        }
    }

    async fn health(&self) -> LedgerHealth {
        match self.swap_stats().await {
            Ok(stats) => {
                let mut health = LedgerHealth::up(&self.config.id, None);
                health.canister_id = Some(self.config.canister_id.clone());
                health.stats = serde_json::to_value(stats).ok();
                health
            }
            Err(e) => {
                let mut health = LedgerHealth::down(&self.config.id, e);
                health.canister_id = Some(self.config.canister_id.clone());
                health
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenType;
    use mockito::Matcher;

    fn config(url: String, token: Option<&str>) -> DestinationConfig {
        DestinationConfig {
            id: "icp".to_string(),
            adapter_type: "intent_gateway".to_string(),
            rpc_url: url,
            canister_id: "uxrrr-q7777-77774-qaaaq-cai".to_string(),
            auth_token: token.map(str::to_string),
            amount: 1_000_000,
            token: TokenType::Icp,
            safety_deposit: 50_000,
        }
    }

    fn gateway(url: String, token: Option<&str>) -> IntentGatewayAdapter {
        IntentGatewayAdapter::new(config(url, token), Duration::from_secs(5)).unwrap()
    }

    fn request() -> CreateIntentRequest {
        CreateIntentRequest {
            swap_id: format!("0x{}", "aa".repeat(32)),
            receiver: "ab".repeat(29),
            amount: 1_000_000,
            token: TokenType::Icp,
            hashlock: format!("0x{}", "bb".repeat(32)),
            origin_address: "0x70997970c51812dc3a010c7d01b50e0d17dc79c8".to_string(),
            timeout_hours: 1,
            safety_deposit: 50_000,
        }
    }

    #[tokio::test]
    async fn test_query_intent_absent_and_present() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({
                "method": "intent_getIntent",
                "params": ["uxrrr-q7777-77774-qaaaq-cai", "0x01"],
            })))
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": null}).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({
                "method": "intent_getIntent",
                "params": ["uxrrr-q7777-77774-qaaaq-cai", "0x02"],
            })))
            .with_body(
                json!({"jsonrpc": "2.0", "id": 1, "result": {"swapId": "0x02", "status": {"Pending": null}}})
                    .to_string(),
            )
            .create_async()
            .await;

        let adapter = gateway(server.url(), None);
        assert_eq!(adapter.query_intent("0x01").await.unwrap(), None);
        let intent = adapter.query_intent("0x02").await.unwrap().unwrap();
        assert_eq!(intent.swap_id, "0x02");
    }

    #[tokio::test]
    async fn test_create_intent_sends_token_and_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer s3cret")
            .match_body(Matcher::PartialJson(json!({
                "method": "intent_createIntent",
                "params": ["uxrrr-q7777-77774-qaaaq-cai", {
                    "token": "ICP",
                    "timeoutHours": 1,
                    "safetyDeposit": 50_000,
                }],
            })))
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": "intent-7"}}).to_string())
            .create_async()
            .await;

        let adapter = gateway(server.url(), Some("s3cret"));
        assert_eq!(adapter.create_intent(&request()).await.unwrap(), "intent-7");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_intent_err_variant() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": {"err": "Swap already exists"}}).to_string())
            .create_async()
            .await;

        let adapter = gateway(server.url(), None);
        let err = adapter.create_intent(&request()).await.unwrap_err();
        assert!(err.to_string().contains("Swap already exists"));
    }

    #[tokio::test]
    async fn test_health_follows_swap_stats() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                json!({"jsonrpc": "2.0", "id": 1, "result": {
                    "totalSwaps": 3, "pendingSwaps": 1, "claimedSwaps": 2, "refundedSwaps": 0
                }})
                .to_string(),
            )
            .create_async()
            .await;
        let adapter = gateway(server.url(), None);
        assert_eq!(adapter.swap_stats().await.unwrap().total_swaps, 3);
        let health = adapter.health().await;
        assert!(health.connected);
        assert_eq!(health.canister_id.as_deref(), Some("uxrrr-q7777-77774-qaaaq-cai"));
        let stats = health.stats.unwrap();
        assert_eq!(stats["totalSwaps"], 3);
        assert_eq!(stats["claimedSwaps"], 2);

        let down = gateway("http://127.0.0.1:1".to_string(), None);
        let health = down.health().await;
        assert!(!health.connected);
        assert_eq!(health.chain_id, "icp");
        assert!(health.stats.is_none());
    }

    #[tokio::test]
    async fn test_silent_gateway_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let adapter = IntentGatewayAdapter::new(config(url, None), Duration::from_millis(200)).unwrap();
        let health = tokio::time::timeout(Duration::from_secs(3), adapter.health())
            .await
            .expect("health must give up on a silent gateway");
        assert!(!health.connected);
        assert!(health.error.is_some());
    }
}
