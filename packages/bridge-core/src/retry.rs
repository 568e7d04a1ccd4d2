use log::error;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    store::{StateEntry, StateStore},
    types::{CrossChainMessage, RetryRecord},
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Ceiling on delivery attempts for one message, the initial delivery included.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Linear backoff: `base` for a fresh record, then `base * attempts`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.base_delay * attempts.max(1)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts.saturating_add(1) >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Rescheduled { attempts: u32, next_retry_at: u64 },
    /// The ceiling was reached; the record has been removed.
    Exhausted(RetryRecord),
}

/// Messages whose delivery failed, ordered by the time they become eligible
/// again. All times are unix milliseconds supplied by the caller.
pub struct RetryScheduler {
    policy: RetryPolicy,
    records: HashMap<String, RetryRecord>,
    schedule: BTreeSet<(u64, String)>,
    store: Arc<dyn StateStore>,
}

impl RetryScheduler {
    pub fn new(
        policy: RetryPolicy,
        records: HashMap<String, RetryRecord>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let schedule = records
            .values()
            .map(|r| (r.next_retry_at, r.message.id.clone()))
            .collect();
        Self {
            policy,
            records,
            schedule,
            store,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Parks a message after its first failed delivery.
    pub fn enqueue(&mut self, message: CrossChainMessage, error: &str, now: u64) -> RetryDecision {
        let record = RetryRecord {
            message,
            attempts: 0,
            last_error: error.to_string(),
            next_retry_at: now + self.policy.delay_for(0).as_millis() as u64,
        };
        if self.policy.is_exhausted(0) {
            return RetryDecision::Exhausted(record);
        }
        let decision = RetryDecision::Rescheduled {
            attempts: 0,
            next_retry_at: record.next_retry_at,
        };
        self.insert(record);
        decision
    }

    /// Records eligible at `now`, earliest first.
    pub fn due(&self, now: u64) -> Vec<RetryRecord> {
        self.schedule
            .iter()
            .take_while(|(at, _)| *at <= now)
            .filter_map(|(_, id)| self.records.get(id).cloned())
            .collect()
    }

    /// Counts one more failed re-delivery of `id`. Returns `None` for ids
    /// that are not scheduled.
    pub fn record_failure(&mut self, id: &str, error: &str, now: u64) -> Option<RetryDecision> {
        let mut record = self.take(id)?;
        record.attempts += 1;
        record.last_error = error.to_string();

        if self.policy.is_exhausted(record.attempts) {
            self.persist(&StateEntry::RetryRemoved(record.message.id.clone()));
            return Some(RetryDecision::Exhausted(record));
        }

        record.next_retry_at = now + self.policy.delay_for(record.attempts).as_millis() as u64;
        let decision = RetryDecision::Rescheduled {
            attempts: record.attempts,
            next_retry_at: record.next_retry_at,
        };
        self.insert(record);
        Some(decision)
    }

    pub fn remove(&mut self, id: &str) -> Option<RetryRecord> {
        let record = self.take(id)?;
        self.persist(&StateEntry::RetryRemoved(id.to_string()));
        Some(record)
    }

    pub fn get(&self, id: &str) -> Option<&RetryRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, record: RetryRecord) {
        self.persist(&StateEntry::RetryUpserted(record.clone()));
        self.schedule
            .insert((record.next_retry_at, record.message.id.clone()));
        self.records.insert(record.message.id.clone(), record);
    }

    fn take(&mut self, id: &str) -> Option<RetryRecord> {
        let record = self.records.remove(id)?;
        self.schedule
            .remove(&(record.next_retry_at, record.message.id.clone()));
        Some(record)
    }

    fn persist(&self, entry: &StateEntry) {
        if let Err(e) = self.store.append(entry) {
            error!("Failed to persist retry state change {:?}: {}", entry, e);
        }
    }
}
