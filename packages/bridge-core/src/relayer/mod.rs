use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    chain_adapter::{DestinationLedger, SourceLedger},
    config::Config,
    dedup::DeduplicationStore,
    delivery::{DeliveryOutcome, DestinationClient, IntentTerms},
    metrics::{Counter, MetricsSnapshot, RelayerMetrics, StatusSnapshot},
    retry::{RetryDecision, RetryPolicy, RetryScheduler},
    store::StateStore,
    types::{unix_now_millis, unix_now_secs, CrossChainMessage, LedgerHealth, MessageOutcome, RetryRecord},
    validator::MessageValidator,
    Error,
};

/// 新消息投递与重试共享的状态
struct PipelineState {
    dedup: DeduplicationStore,
    retries: RetryScheduler,
}

/// 释放时从进行中集合移除对应 id
struct InFlightGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

/// 中继器：对每条消息依次验证、去重、投递，失败的消息交给重试调度
pub struct Relayer {
    config: Config,
    validator: MessageValidator,
    delivery: DestinationClient,
    source: Arc<dyn SourceLedger>,
    destination: Arc<dyn DestinationLedger>,
    state: Mutex<PipelineState>,
    in_flight: StdMutex<HashSet<String>>,
    metrics: RelayerMetrics,
    running: AtomicBool,
}

impl Relayer {
    /// 从 `store` 恢复已处理集合和待重试记录
    pub fn new(
        config: Config,
        source: Arc<dyn SourceLedger>,
        destination: Arc<dyn DestinationLedger>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, Error> {
        let persisted = store.load()?;
        if !persisted.processed.is_empty() || !persisted.retries.is_empty() {
            info!(
                processed = persisted.processed.len(),
                pending_retries = persisted.retries.len(),
                "Restored relay state"
            );
        }

        let policy = RetryPolicy {
            base_delay: config.relayer.retry_delay(),
            max_attempts: config.relayer.max_retries,
        };
        let state = PipelineState {
            dedup: DeduplicationStore::new(persisted.processed, store.clone()),
            retries: RetryScheduler::new(policy, persisted.retries, store),
        };
        let delivery = DestinationClient::new(
            destination.clone(),
            source.clone(),
            IntentTerms::from(&config.destination),
            config.relayer.rpc_timeout(),
        );

        Ok(Self {
            config,
            validator: MessageValidator,
            delivery,
            source,
            destination,
            state: Mutex::new(state),
            in_flight: StdMutex::new(HashSet::new()),
            metrics: RelayerMetrics::new(unix_now_millis()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 持续消费消息直到 `rx` 的所有发送端关闭，期间按各自间隔执行重试和指标输出。
    /// 收到 `shutdown` 后停止重试和指标输出，只清空通道中剩余的消息
    pub async fn start(
        &self,
        mut rx: mpsc::Receiver<CrossChainMessage>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        self.running.store(true, Ordering::SeqCst);
        info!(name = %self.config.relayer.name, "Starting relayer");

        let mut retry_tick = interval(self.config.relayer.retry_delay());
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics_tick = interval(self.config.relayer.metrics_interval());
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 两个定时器都会立即触发一次，跳过首次
        retry_tick.tick().await;
        metrics_tick.tick().await;

        let mut stopping = false;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv(), if !stopping => {
                    stopping = true;
                    info!("Shutdown requested, draining queued messages");
                }
                _ = retry_tick.tick(), if !stopping => {
                    self.retry_due().await;
                }
                _ = metrics_tick.tick(), if !stopping => {
                    let snapshot = self.metrics_snapshot().await;
                    info!(
                        processed = snapshot.messages_processed,
                        errored = snapshot.messages_errored,
                        rejected = snapshot.messages_rejected,
                        dropped = snapshot.messages_dropped,
                        retry_queue = snapshot.retry_queue_size,
                        uptime_ms = snapshot.uptime,
                        "Relayer metrics"
                    );
                }
                received = rx.recv() => match received {
                    Some(message) => {
                        self.handle_message(message).await;
                    }
                    None => break,
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Message channel closed, relayer stopped");
    }

    /// 处理一条新观察到的消息
    pub async fn handle_message(&self, message: CrossChainMessage) -> MessageOutcome {
        self.metrics.touch(unix_now_millis());
        debug!(swap_id = %message.id, block = message.source_block_number, "Message observed");

        if let Err(e) = self.validator.check(&message, unix_now_secs()) {
            self.metrics.incr(Counter::Rejected);
            warn!(swap_id = %message.id, error = %e, "Message rejected");
            return MessageOutcome::Rejected(e.to_string());
        }

        let _guard = {
            let state = self.state.lock().await;
            if state.dedup.has(&message.id) {
                self.metrics.incr(Counter::Deduplicated);
                info!(swap_id = %message.id, "Message already processed, skipping");
                return MessageOutcome::Deduplicated;
            }
            if state.retries.contains(&message.id) {
                debug!(swap_id = %message.id, "Retry already scheduled, leaving delivery to the scheduler");
                return MessageOutcome::RetryPending;
            }
            match self.claim(&message.id) {
                Some(guard) => guard,
                None => {
                    debug!(swap_id = %message.id, "Delivery already in flight");
                    return MessageOutcome::InFlight;
                }
            }
        };

        info!(swap_id = %message.id, "Delivering message");
        match self.delivery.create_intent(&message).await {
            Ok(outcome) => {
                let mut state = self.state.lock().await;
                self.complete(&mut state, &message.id, &outcome);
                MessageOutcome::Completed
            }
            Err(e) => {
                self.metrics.incr(Counter::Errored);
                let now = unix_now_millis();
                let id = message.id.clone();
                let mut state = self.state.lock().await;
                match state.retries.enqueue(message, &e.to_string(), now) {
                    RetryDecision::Rescheduled { next_retry_at, .. } => {
                        warn!(
                            swap_id = %id,
                            error = %e,
                            retry_in_ms = next_retry_at.saturating_sub(now),
                            "Delivery failed, scheduled for retry"
                        );
                        MessageOutcome::Retrying { next_retry_at }
                    }
                    RetryDecision::Exhausted(record) => self.drop_record(record),
                }
            }
        }
    }

    /// 重试所有已到期的记录
    pub async fn retry_due(&self) -> Vec<(String, MessageOutcome)> {
        self.retry_due_at(unix_now_millis()).await
    }

    pub(crate) async fn retry_due_at(&self, now: u64) -> Vec<(String, MessageOutcome)> {
        let due = self.state.lock().await.retries.due(now);
        let mut outcomes = Vec::with_capacity(due.len());
        for record in due {
            let id = record.message.id.clone();
            if let Some(outcome) = self.retry_one(record, now).await {
                outcomes.push((id, outcome));
            }
        }
        outcomes
    }

    async fn retry_one(&self, record: RetryRecord, now: u64) -> Option<MessageOutcome> {
        let id = record.message.id.clone();
        let _guard = {
            let mut state = self.state.lock().await;
            if state.dedup.has(&id) {
                state.retries.remove(&id);
                self.metrics.incr(Counter::Deduplicated);
                info!(swap_id = %id, "Retry target already processed, removing record");
                return Some(MessageOutcome::Deduplicated);
            }
            if !state.retries.contains(&id) {
                return None;
            }
            self.claim(&id)?
        };

        self.metrics.touch(now);
        info!(swap_id = %id, attempt = record.attempts + 1, "Retrying delivery");
        match self.delivery.create_intent(&record.message).await {
            Ok(outcome) => {
                let mut state = self.state.lock().await;
                state.retries.remove(&id);
                self.complete(&mut state, &id, &outcome);
                Some(MessageOutcome::Completed)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                match state.retries.record_failure(&id, &e.to_string(), now)? {
                    RetryDecision::Rescheduled {
                        attempts,
                        next_retry_at,
                    } => {
                        warn!(
                            swap_id = %id,
                            attempt = attempts,
                            error = %e,
                            retry_in_ms = next_retry_at.saturating_sub(now),
                            "Retry failed, rescheduled"
                        );
                        Some(MessageOutcome::Retrying { next_retry_at })
                    }
                    RetryDecision::Exhausted(record) => Some(self.drop_record(record)),
                }
            }
        }
    }

    fn complete(&self, state: &mut PipelineState, id: &str, outcome: &DeliveryOutcome) {
        if let Err(e) = state.dedup.mark_processed(id) {
            error!(swap_id = %id, error = %e, "Failed to persist processed mark");
        }
        self.metrics.incr(Counter::Processed);
        self.metrics.touch(unix_now_millis());
        match outcome {
            DeliveryOutcome::Created { intent_id, receipt } => info!(
                swap_id = %id,
                intent_id = %intent_id,
                ack_tx = %receipt.tx_hash,
                "Message relayed"
            ),
            DeliveryOutcome::AlreadyExists { receipt } => info!(
                swap_id = %id,
                ack_tx = %receipt.tx_hash,
                "Intent already existed, message acknowledged"
            ),
        }
    }

    fn drop_record(&self, record: RetryRecord) -> MessageOutcome {
        self.metrics.incr(Counter::Dropped);
        error!(
            swap_id = %record.message.id,
            attempts = record.attempts + 1,
            last_error = %record.last_error,
            receiver = %record.message.receiver,
            hashlock = %record.message.hashlock,
            timelock = record.message.timelock,
            source_tx = %record.message.source_tx_hash,
            "Max retries reached, message dropped"
        );
        MessageOutcome::Dropped {
            last_error: record.last_error,
        }
    }

    fn claim(&self, id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    pub async fn is_processed(&self, id: &str) -> bool {
        self.state.lock().await.dedup.has(id)
    }

    pub async fn retry_record(&self, id: &str) -> Option<RetryRecord> {
        self.state.lock().await.retries.get(id).cloned()
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let (retry_queue_size, processed_count) = {
            let state = self.state.lock().await;
            (state.retries.len(), state.dedup.len())
        };
        self.metrics.snapshot(
            &self.config.relayer.name,
            self.is_running(),
            retry_queue_size,
            processed_count,
            unix_now_millis(),
        )
    }

    /// 指标加上两条链的实时健康检查，每个检查受 RPC 超时限制
    pub async fn status(&self) -> StatusSnapshot {
        let limit = self.config.relayer.rpc_timeout();
        let (source, destination) = tokio::join!(
            probe(&self.config.source.id, limit, self.source.health()),
            probe(&self.config.destination.id, limit, self.destination.health()),
        );
        StatusSnapshot::new(self.metrics_snapshot().await, source, destination)
    }
}

/// 等待 `health`，超过 `limit` 则视为链不可用
pub async fn probe<F>(chain_id: &str, limit: Duration, health: F) -> LedgerHealth
where
    F: std::future::Future<Output = LedgerHealth>,
{
    match tokio::time::timeout(limit, health).await {
        Ok(health) => health,
        Err(_) => LedgerHealth::down(chain_id, format!("health check timed out after {}ms", limit.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::{MockDestinationLedger, MockSourceLedger};
    use crate::config::tests::sample;
    use crate::store::{FileStateStore, MemoryStateStore};
    use crate::types::{fixtures::message, fixtures::valid_message, CreateIntentRequest, Intent, Receipt};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn receipt() -> Receipt {
        Receipt {
            tx_hash: "0xfeed".to_string(),
            block_number: 100,
        }
    }

    fn acking_source() -> MockSourceLedger {
        let mut source = MockSourceLedger::new();
        source
            .expect_acknowledge_processed()
            .returning(|_| Ok(receipt()));
        source
    }

    fn relayer_with(
        max_retries: u32,
        source: impl SourceLedger + 'static,
        destination: impl DestinationLedger + 'static,
    ) -> Relayer {
        let mut config = sample();
        config.relayer.max_retries = max_retries;
        config.relayer.rpc_timeout_ms = 500;
        Relayer::new(
            config,
            Arc::new(source),
            Arc::new(destination),
            Arc::new(MemoryStateStore),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_message_is_delivered_and_marked() {
        let msg = valid_message();
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().times(1).returning(|_| Ok(None));
        dest.expect_create_intent()
            .times(1)
            .returning(|_| Ok("intent-1".to_string()));
        let relayer = relayer_with(3, acking_source(), dest);

        assert_eq!(relayer.handle_message(msg.clone()).await, MessageOutcome::Completed);
        assert!(relayer.is_processed(&msg.id).await);
        let snap = relayer.metrics_snapshot().await;
        assert_eq!(snap.messages_processed, 1);
        assert_eq!(snap.processed_count, 1);
        assert_eq!(snap.retry_queue_size, 0);
    }

    #[tokio::test]
    async fn test_replayed_message_is_deduplicated() {
        let msg = valid_message();
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().times(1).returning(|_| Ok(None));
        dest.expect_create_intent()
            .times(1)
            .returning(|_| Ok("intent-1".to_string()));
        let relayer = relayer_with(3, acking_source(), dest);

        assert_eq!(relayer.handle_message(msg.clone()).await, MessageOutcome::Completed);
        assert_eq!(relayer.handle_message(msg).await, MessageOutcome::Deduplicated);
        let snap = relayer.metrics_snapshot().await;
        assert_eq!(snap.messages_processed, 1);
        assert_eq!(snap.messages_deduplicated, 1);
    }

    #[tokio::test]
    async fn test_expired_timelock_is_rejected_without_side_effects() {
        let msg = message('a', unix_now_secs() - 10);
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().never();
        dest.expect_create_intent().never();
        let mut source = MockSourceLedger::new();
        source.expect_acknowledge_processed().never();
        let relayer = relayer_with(3, source, dest);

        let outcome = relayer.handle_message(msg.clone()).await;
        assert!(matches!(outcome, MessageOutcome::Rejected(_)));
        assert!(!relayer.is_processed(&msg.id).await);
        assert!(relayer.retry_record(&msg.id).await.is_none());
        let snap = relayer.metrics_snapshot().await;
        assert_eq!(snap.messages_errored, 0);
        assert_eq!(snap.messages_rejected, 1);
    }

    #[tokio::test]
    async fn test_malformed_ids_are_rejected() {
        let dest = MockDestinationLedger::new();
        let relayer = relayer_with(3, MockSourceLedger::new(), dest);

        let mut upper = valid_message();
        upper.id = upper.id.to_uppercase().replacen("0X", "0x", 1);
        let mut short_hashlock = valid_message();
        short_hashlock.hashlock = "0xbb".to_string();
        let mut no_receiver = valid_message();
        no_receiver.receiver.clear();

        for msg in [upper, short_hashlock, no_receiver] {
            assert!(matches!(
                relayer.handle_message(msg).await,
                MessageOutcome::Rejected(_)
            ));
        }
        assert_eq!(relayer.metrics_snapshot().await.messages_rejected, 3);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries_after_max_attempts() {
        let msg = valid_message();
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().returning(|_| Ok(None));
        dest.expect_create_intent().times(3).returning(|_| {
            Err(Error::Timeout {
                action: "create intent",
                timeout_ms: 500,
            })
        });
        let mut source = MockSourceLedger::new();
        source.expect_acknowledge_processed().never();
        let relayer = relayer_with(3, source, dest);

        let next_retry_at = match relayer.handle_message(msg.clone()).await {
            MessageOutcome::Retrying { next_retry_at } => next_retry_at,
            other => panic!("expected retry, got {:?}", other),
        };
        assert_eq!(relayer.retry_record(&msg.id).await.unwrap().attempts, 0);

        let now = next_retry_at;
        let first = relayer.retry_due_at(now).await;
        assert!(matches!(first[0].1, MessageOutcome::Retrying { .. }));
        assert_eq!(relayer.retry_record(&msg.id).await.unwrap().attempts, 1);

        let second = relayer.retry_due_at(now + 3_600_000).await;
        assert!(matches!(second[0].1, MessageOutcome::Dropped { .. }));
        assert!(relayer.retry_record(&msg.id).await.is_none());

        assert!(relayer.retry_due_at(now + 7_200_000).await.is_empty());
        let snap = relayer.metrics_snapshot().await;
        assert_eq!(snap.messages_errored, 1);
        assert_eq!(snap.messages_dropped, 1);
        assert_eq!(snap.retry_queue_size, 0);
        assert!(!relayer.is_processed(&msg.id).await);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failure() {
        let msg = valid_message();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().returning(|_| Ok(None));
        dest.expect_create_intent().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Network("connection reset".to_string()))
            } else {
                Ok("intent-2".to_string())
            }
        });
        let relayer = relayer_with(3, acking_source(), dest);

        let MessageOutcome::Retrying { next_retry_at } = relayer.handle_message(msg.clone()).await
        else {
            panic!("expected retry");
        };
        assert!(relayer.retry_due_at(next_retry_at - 1).await.is_empty());
        let outcomes = relayer.retry_due_at(next_retry_at).await;
        assert_eq!(outcomes, vec![(msg.id.clone(), MessageOutcome::Completed)]);
        assert!(relayer.is_processed(&msg.id).await);
        assert!(relayer.retry_record(&msg.id).await.is_none());
        assert_eq!(relayer.metrics_snapshot().await.messages_processed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_while_retry_pending_defers_to_scheduler() {
        let msg = valid_message();
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().returning(|_| Ok(None));
        dest.expect_create_intent()
            .times(1)
            .returning(|_| Err(Error::Chain("nonce too low".to_string())));
        let relayer = relayer_with(3, MockSourceLedger::new(), dest);

        assert!(matches!(
            relayer.handle_message(msg.clone()).await,
            MessageOutcome::Retrying { .. }
        ));
        assert_eq!(relayer.handle_message(msg).await, MessageOutcome::RetryPending);
    }

    /// Destination that stays inside `create_intent` long enough for a second
    /// caller to race it, tracking the peak number of concurrent calls.
    #[derive(Default)]
    struct SlowDestination {
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DestinationLedger for SlowDestination {
        async fn query_intent(&self, _id: &str) -> Result<Option<Intent>, Error> {
            Ok(None)
        }

        async fn create_intent(&self, _request: &CreateIntentRequest) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Network("unavailable".to_string()))
            } else {
                Ok("intent".to_string())
            }
        }

        async fn health(&self) -> LedgerHealth {
            LedgerHealth::up("icp", None)
        }
    }

    #[tokio::test]
    async fn test_concurrent_fresh_deliveries_single_flight() {
        let dest = Arc::new(SlowDestination::default());
        let mut config = sample();
        config.relayer.max_retries = 3;
        let relayer = Relayer::new(
            config,
            Arc::new(acking_source()),
            dest.clone(),
            Arc::new(MemoryStateStore),
        )
        .unwrap();

        let msg = valid_message();
        let (a, b) = tokio::join!(
            relayer.handle_message(msg.clone()),
            relayer.handle_message(msg.clone())
        );
        let outcomes = [a, b];
        assert!(outcomes.contains(&MessageOutcome::Completed));
        assert!(outcomes.contains(&MessageOutcome::InFlight));
        assert_eq!(dest.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dest.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_event_during_retry_does_not_double_create() {
        let dest = Arc::new(SlowDestination {
            fail: true,
            ..Default::default()
        });
        let relayer = Relayer::new(
            sample(),
            Arc::new(MockSourceLedger::new()),
            dest.clone(),
            Arc::new(MemoryStateStore),
        )
        .unwrap();

        let msg = valid_message();
        let MessageOutcome::Retrying { next_retry_at } = relayer.handle_message(msg.clone()).await
        else {
            panic!("expected retry");
        };

        let (retried, fresh) = tokio::join!(relayer.retry_due_at(next_retry_at), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            relayer.handle_message(msg.clone()).await
        });
        assert_eq!(retried.len(), 1);
        assert_eq!(fresh, MessageOutcome::RetryPending);
        assert_eq!(dest.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dest.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fault_free_message_never_enters_retry() {
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().returning(|_| Ok(None));
        dest.expect_create_intent()
            .returning(|_| Ok("intent".to_string()));
        let relayer = relayer_with(3, acking_source(), dest);

        for id in ['1', '2', '3'] {
            let msg = message(id, unix_now_secs() + 7200);
            assert_eq!(relayer.handle_message(msg.clone()).await, MessageOutcome::Completed);
            assert!(relayer.retry_record(&msg.id).await.is_none());
        }
        let snap = relayer.metrics_snapshot().await;
        assert_eq!(snap.messages_processed, 3);
        assert_eq!(snap.messages_errored, 0);
    }

    #[tokio::test]
    async fn test_existing_destination_intent_counts_as_success() {
        let msg = valid_message();
        let mut dest = MockDestinationLedger::new();
        let swap_id = msg.id.clone();
        dest.expect_query_intent().returning(move |_| {
            Ok(Some(Intent {
                swap_id: swap_id.clone(),
                receiver: None,
                hashlock: None,
                status: None,
            }))
        });
        dest.expect_create_intent().never();
        let relayer = relayer_with(3, acking_source(), dest);

        assert_eq!(relayer.handle_message(msg.clone()).await, MessageOutcome::Completed);
        assert!(relayer.is_processed(&msg.id).await);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = std::env::temp_dir().join(format!("relay-restart-{}", unix_now_millis()));
        let path = dir.join("state.log");
        let done = message('1', unix_now_secs() + 7200);
        let pending = message('2', unix_now_secs() + 7200);

        {
            let mut dest = MockDestinationLedger::new();
            dest.expect_query_intent().returning(|_| Ok(None));
            let done_id = done.id.clone();
            dest.expect_create_intent().returning(move |req| {
                if req.swap_id == done_id {
                    Ok("intent".to_string())
                } else {
                    Err(Error::Network("down".to_string()))
                }
            });
            let store = Arc::new(FileStateStore::open(&path).unwrap());
            let relayer =
                Relayer::new(sample(), Arc::new(acking_source()), Arc::new(dest), store).unwrap();
            relayer.handle_message(done.clone()).await;
            relayer.handle_message(pending.clone()).await;
        }

        let mut dest = MockDestinationLedger::new();
        dest.expect_create_intent().never();
        let store = Arc::new(FileStateStore::open(&path).unwrap());
        let relayer =
            Relayer::new(sample(), Arc::new(MockSourceLedger::new()), Arc::new(dest), store).unwrap();
        assert!(relayer.is_processed(&done.id).await);
        assert_eq!(relayer.handle_message(done).await, MessageOutcome::Deduplicated);
        assert_eq!(relayer.retry_record(&pending.id).await.unwrap().attempts, 0);
        assert_eq!(relayer.metrics_snapshot().await.retry_queue_size, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_start_drains_channel_and_stops_when_closed() {
        let mut dest = MockDestinationLedger::new();
        dest.expect_query_intent().returning(|_| Ok(None));
        dest.expect_create_intent()
            .times(2)
            .returning(|_| Ok("intent".to_string()));
        let relayer = Arc::new(relayer_with(3, acking_source(), dest));

        let (tx, rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let runner = {
            let relayer = relayer.clone();
            tokio::spawn(async move { relayer.start(rx, stop_rx).await })
        };
        tx.send(message('1', unix_now_secs() + 7200)).await.unwrap();
        tx.send(message('2', unix_now_secs() + 7200)).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(!relayer.is_running());
        assert_eq!(relayer.metrics_snapshot().await.messages_processed, 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_retry_sweeps_while_draining() {
        let dest = Arc::new(SlowDestination {
            fail: true,
            ..Default::default()
        });
        let mut config = sample();
        config.relayer.retry_delay_ms = 20;
        let relayer = Relayer::new(
            config,
            Arc::new(MockSourceLedger::new()),
            dest.clone(),
            Arc::new(MemoryStateStore),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel(8);
        for id in ['1', '2', '3'] {
            tx.send(message(id, unix_now_secs() + 7200)).await.unwrap();
        }
        drop(tx);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        stop_tx.send(()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), relayer.start(rx, stop_rx))
            .await
            .unwrap();
        assert_eq!(dest.calls.load(Ordering::SeqCst), 3);
        let snap = relayer.metrics_snapshot().await;
        assert_eq!(snap.messages_errored, 3);
        assert_eq!(snap.retry_queue_size, 3);
        for id in ['1', '2', '3'] {
            let record = relayer.retry_record(&message(id, 0).id).await.unwrap();
            assert_eq!(record.attempts, 0);
        }
    }

    #[tokio::test]
    async fn test_slow_destination_is_cut_off_and_retried() {
        let dest = Arc::new(SlowDestination::default());
        let mut config = sample();
        config.relayer.rpc_timeout_ms = 10;
        let relayer = Relayer::new(
            config,
            Arc::new(MockSourceLedger::new()),
            dest.clone(),
            Arc::new(MemoryStateStore),
        )
        .unwrap();

        let msg = valid_message();
        let outcome = relayer.handle_message(msg.clone()).await;
        assert!(matches!(outcome, MessageOutcome::Retrying { .. }));
        let record = relayer.retry_record(&msg.id).await.unwrap();
        assert!(record.last_error.contains("Timed out"), "{}", record.last_error);
        assert!(record.last_error.contains("create intent"));
        assert!(!relayer.is_processed(&msg.id).await);
        assert_eq!(dest.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_health_check_reports_disconnected() {
        let started = std::time::Instant::now();
        let hung = std::future::pending::<LedgerHealth>();
        let health = probe("ethereum", Duration::from_millis(20), hung).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!health.connected);
        assert_eq!(health.chain_id, "ethereum");
        assert!(health.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_status_reports_ledger_health() {
        let mut source = MockSourceLedger::new();
        source
            .expect_health()
            .returning(|| LedgerHealth::down("ethereum", "connection refused"));
        let mut dest = MockDestinationLedger::new();
        dest.expect_health().returning(|| LedgerHealth::up("icp", None));
        let relayer = relayer_with(3, source, dest);

        let status = relayer.status().await;
        assert!(!status.is_healthy());
        assert_eq!(status.status, "unhealthy");
        assert!(!status.source.connected);
        assert!(status.destination.connected);
    }
}
