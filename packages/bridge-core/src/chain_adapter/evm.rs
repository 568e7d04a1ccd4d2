use alloy::primitives::{Address, FixedBytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{reqwest::Url, Client, Http};
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::SourceLedger;
use crate::{
    config::SourceConfig,
    types::{LedgerHealth, LockEvent, Receipt},
    Error,
};

sol! {
    /// Source-side lock bridge.
    #[sol(rpc)]
    contract Bridge {
        event CrossChainMessage(
            bytes32 indexed swapId,
            string sourceChain,
            string targetChain,
            string targetCanister,
            string receiver,
            bytes32 hashlock,
            uint256 timelock,
            uint256 timestamp
        );

        function pendingMessages(bytes32 swapId) external view returns (
            bytes32 id,
            string sourceChain,
            string targetChain,
            string targetCanister,
            string receiver,
            bytes32 hashlock,
            uint256 timelock,
            uint256 timestamp,
            bool processed
        );

        function markMessageProcessed(bytes32 swapId) external;
    }
}

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const GWEI: u128 = 1_000_000_000;

/// Source ledger reached over Ethereum JSON-RPC. `markMessageProcessed` goes
/// out through `eth_sendTransaction`, so `relayer_address` must be unlocked
/// on the node or behind a signing proxy.
pub struct EvmSourceAdapter {
    provider: RootProvider<Http<Client>>,
    config: SourceConfig,
    bridge: Address,
    relayer: Address,
}

impl EvmSourceAdapter {
    /// Every HTTP request to the node is cut off after `rpc_timeout`.
    pub fn new(config: SourceConfig, rpc_timeout: Duration) -> Result<Self, Error> {
        let url = Url::parse(&config.rpc_url)
            .map_err(|e| Error::Config(format!("Invalid source rpc_url: {}", e)))?;
        let bridge = Address::from_str(&config.bridge_address)
            .map_err(|e| Error::Config(format!("Invalid bridge_address: {}", e)))?;
        let relayer = Address::from_str(&config.relayer_address)
            .map_err(|e| Error::Config(format!("Invalid relayer_address: {}", e)))?;

        let client = Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build source HTTP client: {}", e)))?;
        let provider =
            ProviderBuilder::new().on_client(RpcClient::new(Http::with_client(client, url), false));

        Ok(Self {
            provider,
            config,
            bridge,
            relayer,
        })
    }

    async fn gas_price(&self) -> Result<u128, Error> {
        let node_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| transport_err("eth_gasPrice", e))?;
        let cap = self.config.max_gas_price_gwei as u128 * GWEI;
        Ok(node_price.min(cap))
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Receipt, Error> {
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| transport_err("eth_getTransactionReceipt", e))?;

            if let Some(receipt) = receipt {
                if !receipt.status() {
                    return Err(Error::Chain(format!("transaction 0x{:x} reverted", tx_hash)));
                }
                if let Some(block_number) = receipt.block_number {
                    let head = self.current_height().await?;
                    let depth = head.saturating_sub(block_number) + 1;
                    if depth >= self.config.confirmations {
                        return Ok(Receipt {
                            tx_hash: format!("0x{:x}", receipt.transaction_hash),
                            block_number,
                        });
                    }
                    debug!(tx_hash = %tx_hash, depth, "Waiting for confirmations");
                }
            }

            sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl SourceLedger for EvmSourceAdapter {
    async fn current_height(&self) -> Result<u64, Error> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| transport_err("eth_blockNumber", e))
    }

    async fn lock_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LockEvent>, Error> {
        let filter = Filter::new()
            .address(self.bridge)
            .event_signature(Bridge::CrossChainMessage::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| transport_err("eth_getLogs", e))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|l| !l.removed) {
            match decode_lock_event(log) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    tx_hash = ?log.transaction_hash,
                    error = %e,
                    "Dropping undecodable CrossChainMessage log"
                ),
            }
        }
        Ok(events)
    }

    async fn is_processed(&self, id: &str) -> Result<bool, Error> {
        let bridge = Bridge::new(self.bridge, &self.provider);
        let pending = bridge
            .pendingMessages(id_bytes(id)?)
            .call()
            .await
            .map_err(|e| contract_err("pendingMessages", e))?;
        Ok(pending.processed)
    }

    async fn acknowledge_processed(&self, id: &str) -> Result<Receipt, Error> {
        let gas_price = self.gas_price().await?;
        let bridge = Bridge::new(self.bridge, &self.provider);

        let pending_tx = bridge
            .markMessageProcessed(id_bytes(id)?)
            .from(self.relayer)
            .gas(self.config.gas_limit)
            .gas_price(gas_price)
            .send()
            .await
            .map_err(|e| contract_err("markMessageProcessed", e))?;
        let tx_hash = *pending_tx.tx_hash();
        info!(swap_id = id, tx_hash = %tx_hash, "Message processed transaction sent");

        let receipt = self.wait_for_receipt(tx_hash).await?;
        info!(
            swap_id = id,
            tx_hash = %receipt.tx_hash,
            block_number = receipt.block_number,
            "Message processed confirmed"
        );
        Ok(receipt)
    }

    async fn health(&self) -> LedgerHealth {
        match self.current_height().await {
            Ok(height) => LedgerHealth::up(&self.config.id, Some(height)),
            Err(e) => LedgerHealth::down(&self.config.id, e),
        }
    }
}

fn decode_lock_event(log: &Log) -> Result<LockEvent, Error> {
    let decoded = log
        .log_decode::<Bridge::CrossChainMessage>()
        .map_err(|e| Error::MalformedEvent(e.to_string()))?;
    let event = decoded.inner.data;

    Ok(LockEvent {
        swap_id: event.swapId.0,
        source_chain: event.sourceChain,
        target_chain: event.targetChain,
        target_identity: event.targetCanister,
        receiver: event.receiver,
        hashlock: event.hashlock.0,
        timelock: event.timelock.to_be_bytes::<32>(),
        timestamp: event.timestamp.to_be_bytes::<32>(),
        block_number: log.block_number,
        tx_hash: log.transaction_hash.map(|h| format!("0x{:x}", h)),
    })
}

fn id_bytes(id: &str) -> Result<FixedBytes<32>, Error> {
    FixedBytes::<32>::from_str(id)
        .map_err(|e| Error::MalformedEvent(format!("invalid swap id {:?}: {}", id, e)))
}

/// JSON-RPC error replies are chain errors; everything else is the network.
fn transport_err(method: &str, e: TransportError) -> Error {
    match e {
        RpcError::ErrorResp(payload) => Error::Chain(format!(
            "{} failed ({}): {}",
            method, payload.code, payload.message
        )),
        other => Error::Network(format!("{} failed: {}", method, other)),
    }
}

fn contract_err(method: &str, e: alloy::contract::Error) -> Error {
    match e {
        alloy::contract::Error::TransportError(e) => transport_err(method, e),
        other => Error::Chain(format!("{} failed: {}", method, other)),
    }
}
