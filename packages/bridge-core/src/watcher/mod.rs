use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    chain_adapter::SourceLedger,
    config::SourceConfig,
    types::{CrossChainMessage, LockEvent},
    with_timeout, Error,
};

/// Turns source-ledger lock events into a stream of [`CrossChainMessage`]s.
///
/// Blocks are read only once they are `confirmations` deep. On the first
/// poll the watcher starts at `start_block` when set, otherwise
/// `replay_window` blocks behind the safe head, so events missed while the
/// relay was down are delivered again. The watcher never writes to the
/// ledger.
pub struct SourceWatcher {
    source: Arc<dyn SourceLedger>,
    config: SourceConfig,
    rpc_timeout: Duration,
    next_block: Option<u64>,
}

impl SourceWatcher {
    pub fn new(source: Arc<dyn SourceLedger>, config: SourceConfig, rpc_timeout: Duration) -> Self {
        let next_block = config.start_block;
        Self {
            source,
            config,
            rpc_timeout,
            next_block,
        }
    }

    /// Overrides the checkpoint the next poll resumes from.
    pub fn with_start_block(mut self, block: u64) -> Self {
        self.next_block = Some(block);
        self
    }

    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    pub async fn run(
        &mut self,
        tx: mpsc::Sender<CrossChainMessage>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<(), Error> {
        info!(
            chain = %self.config.id,
            confirmations = self.config.confirmations,
            "Source watcher starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping source watcher");
                    break;
                }
                polled = self.poll_once(&tx) => {
                    if let Err(e) = polled {
                        warn!(error = %e, "Source poll failed, will retry");
                    }
                }
            }

            if tx.is_closed() {
                info!("Message channel closed, stopping source watcher");
                break;
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping source watcher");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        Ok(())
    }

    /// Reads every confirmed block past the checkpoint and forwards the
    /// events found. The checkpoint advances one chunk at a time, only after
    /// the whole chunk was forwarded; a failure leaves it on the chunk so the
    /// next poll reads it again.
    pub async fn poll_once(&mut self, tx: &mpsc::Sender<CrossChainMessage>) -> Result<usize, Error> {
        let height = with_timeout("fetch block height", self.rpc_timeout, self.source.current_height()).await?;
        let safe_head = height.saturating_sub(self.config.confirmations);

        let mut from = match self.next_block {
            Some(block) => block,
            None => {
                let start = safe_head.saturating_sub(self.config.replay_window);
                info!(from = start, to = safe_head, "Replaying recent source blocks");
                start
            }
        };
        self.next_block = Some(from);

        let range = self.config.max_block_range.max(1);
        let mut forwarded = 0;
        while from <= safe_head {
            let to = safe_head.min(from.saturating_add(range - 1));
            let events = with_timeout(
                "fetch lock events",
                self.rpc_timeout,
                self.source.lock_events(from, to),
            )
            .await?;
            debug!(from, to, events = events.len(), "Fetched source events");

            for event in events {
                if let Some(message) = self.normalize(event).await {
                    if tx.send(message).await.is_err() {
                        return Ok(forwarded);
                    }
                    forwarded += 1;
                }
            }

            from = to + 1;
            self.next_block = Some(from);
        }

        Ok(forwarded)
    }

    async fn normalize(&self, event: LockEvent) -> Option<CrossChainMessage> {
        let message = match CrossChainMessage::try_from(event) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed lock event");
                return None;
            }
        };

        if self.config.skip_processed {
            match with_timeout(
                "check processed flag",
                self.rpc_timeout,
                self.source.is_processed(&message.id),
            )
            .await
            {
                Ok(true) => {
                    debug!(swap_id = %message.id, "Already processed on source, skipping");
                    return None;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(swap_id = %message.id, error = %e, "Processed flag unavailable, forwarding");
                }
            }
        }

        info!(
            swap_id = %message.id,
            block = message.source_block_number,
            tx = %message.source_tx_hash,
            "Lock event observed"
        );
        Some(message)
    }
}
