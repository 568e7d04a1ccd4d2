use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    store::{StateEntry, StateStore},
    Error,
};

/// Ids of messages whose delivery finished end to end. Entries are never
/// removed while the process runs.
pub struct DeduplicationStore {
    processed: HashSet<String>,
    store: Arc<dyn StateStore>,
}

impl DeduplicationStore {
    pub fn new(processed: HashSet<String>, store: Arc<dyn StateStore>) -> Self {
        Self { processed, store }
    }

    pub fn has(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    /// Records `id` as complete. Call only after both the destination intent
    /// and the source acknowledgment succeeded.
    ///
    /// The in-memory mark is applied even when persisting it fails, so the
    /// running process still refuses duplicates.
    pub fn mark_processed(&mut self, id: &str) -> Result<(), Error> {
        if !self.processed.insert(id.to_string()) {
            return Ok(());
        }
        self.store.append(&StateEntry::Processed(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}
