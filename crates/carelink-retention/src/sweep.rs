//! Restartable paged eviction over the message index.

use crate::RetentionResult;
use carelink_store::{MessageKey, RecordStore};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Rows examined per page.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Keyset cursor over messages older than a cutoff.
///
/// Each [`next_page`](Self::next_page) deletes one page in its own
/// transaction and remembers the last (`created_at`, `id`) it examined, so a
/// sweep interrupted between pages can continue with [`resume`](Self::resume)
/// without rescanning.
pub struct EvictionSweep {
    store: RecordStore,
    cutoff: DateTime<Utc>,
    after: Option<MessageKey>,
    page_size: usize,
    done: bool,
}

impl EvictionSweep {
    pub fn new(store: RecordStore, cutoff: DateTime<Utc>) -> Self {
        Self {
            store,
            cutoff,
            after: None,
            page_size: DEFAULT_PAGE_SIZE,
            done: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Continue a sweep from a saved position.
    pub fn resume(mut self, after: Option<MessageKey>) -> Self {
        self.after = after;
        self.done = false;
        self
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }

    /// Last key examined so far.
    pub fn position(&self) -> Option<&MessageKey> {
        self.after.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Delete the next page. Returns the number of messages deleted, or
    /// `None` once nothing older than the cutoff remains past the cursor.
    pub async fn next_page(&mut self) -> RetentionResult<Option<usize>> {
        if self.done {
            return Ok(None);
        }

        let page = self
            .store
            .evict_message_page(self.cutoff, self.after.clone(), self.page_size)
            .await?;

        if page.scanned < self.page_size {
            self.done = true;
        }
        match page.last_key {
            Some(key) => {
                debug!(
                    scanned = page.scanned,
                    deleted = page.deleted,
                    position = %key.id,
                    "Eviction page processed"
                );
                self.after = Some(key);
                Ok(Some(page.deleted))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Run the sweep to the end and return the total deleted.
    pub async fn run(&mut self) -> RetentionResult<usize> {
        let mut total = 0;
        while let Some(deleted) = self.next_page().await? {
            total += deleted;
        }
        Ok(total)
    }
}
