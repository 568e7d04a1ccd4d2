use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::{
    chain_adapter::{DestinationLedger, SourceLedger},
    config::DestinationConfig,
    types::{unix_now_secs, CreateIntentRequest, CrossChainMessage, Receipt, TokenType},
    with_timeout, Error,
};

/// Fixed terms attached to every intent created on the destination ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentTerms {
    pub amount: u64,
    pub token: TokenType,
    pub safety_deposit: u64,
}

impl From<&DestinationConfig> for IntentTerms {
    fn from(config: &DestinationConfig) -> Self {
        Self {
            amount: config.amount,
            token: config.token.clone(),
            safety_deposit: config.safety_deposit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The destination already held an intent for the id.
    AlreadyExists { receipt: Receipt },
    Created { intent_id: String, receipt: Receipt },
}

/// Idempotent delivery of one message: look up, create if absent, then
/// acknowledge on the source ledger. Any failure means the whole sequence is
/// repeated from the lookup on the next attempt.
pub struct DestinationClient {
    destination: Arc<dyn DestinationLedger>,
    source: Arc<dyn SourceLedger>,
    terms: IntentTerms,
    rpc_timeout: Duration,
}

impl DestinationClient {
    pub fn new(
        destination: Arc<dyn DestinationLedger>,
        source: Arc<dyn SourceLedger>,
        terms: IntentTerms,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            destination,
            source,
            terms,
            rpc_timeout,
        }
    }

    pub async fn create_intent(&self, message: &CrossChainMessage) -> Result<DeliveryOutcome, Error> {
        let existing = with_timeout(
            "query intent",
            self.rpc_timeout,
            self.destination.query_intent(&message.id),
        )
        .await?;

        let intent_id = match existing {
            Some(_) => {
                info!(swap_id = %message.id, "Intent already exists on destination, acknowledging");
                None
            }
            None => {
                let request = self.build_request(message, unix_now_secs());
                info!(
                    swap_id = %message.id,
                    receiver = %request.receiver,
                    timeout_hours = request.timeout_hours,
                    "Creating intent on destination"
                );
                let intent_id = with_timeout(
                    "create intent",
                    self.rpc_timeout,
                    self.destination.create_intent(&request),
                )
                .await?;
                Some(intent_id)
            }
        };

        info!(swap_id = %message.id, "Acknowledging message on source");
        let receipt = with_timeout(
            "acknowledge processed",
            self.rpc_timeout,
            self.source.acknowledge_processed(&message.id),
        )
        .await?;

        Ok(match intent_id {
            Some(intent_id) => DeliveryOutcome::Created { intent_id, receipt },
            None => DeliveryOutcome::AlreadyExists { receipt },
        })
    }

    pub fn build_request(&self, message: &CrossChainMessage, now: u64) -> CreateIntentRequest {
        CreateIntentRequest {
            swap_id: message.id.clone(),
            receiver: derive_receiver_identity(&message.receiver),
            amount: self.terms.amount,
            token: self.terms.token.clone(),
            hashlock: message.hashlock.clone(),
            origin_address: message.receiver.clone(),
            timeout_hours: timeout_hours(message.timelock, now),
            safety_deposit: self.terms.safety_deposit,
        }
    }
}

/// Destination identity for a source-side receiver: the first 29 bytes of
/// SHA-256 over the trimmed, lower-cased address, hex encoded.
pub fn derive_receiver_identity(receiver: &str) -> String {
    let digest = Sha256::digest(receiver.trim().to_lowercase().as_bytes());
    hex::encode(&digest[..29])
}

/// Whole hours until `timelock`, never less than one.
pub fn timeout_hours(timelock: u64, now: u64) -> u64 {
    (timelock.saturating_sub(now) / 3600).max(1)
}
