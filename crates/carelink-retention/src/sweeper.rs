//! Periodic cleanup of expired messages and exhausted outbox items.

use crate::{EvictionSweep, RetentionResult};
use carelink_core::Clock;
use carelink_outbox::RetryPolicy;
use carelink_store::{RecordStore, StorageUsage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Totals from one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_messages: usize,
    pub abandoned_items: usize,
}

#[derive(Clone)]
pub struct CleanupSweeper {
    store: RecordStore,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl CleanupSweeper {
    pub fn new(store: RecordStore, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
            page_size: crate::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// A sweep over messages older than `max_age_days`, not yet started.
    /// Zero days means everything created before now. A window reaching past
    /// the earliest representable time evicts nothing.
    pub fn eviction_sweep(&self, max_age_days: u32) -> EvictionSweep {
        let cutoff = chrono::Duration::try_days(i64::from(max_age_days))
            .and_then(|age| self.clock.now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        EvictionSweep::new(self.store.clone(), cutoff).with_page_size(self.page_size)
    }

    /// Delete messages older than `max_age_days`. Messages still waiting in
    /// the outbox are kept.
    pub async fn evict_old_messages(&self, max_age_days: u32) -> RetentionResult<usize> {
        let mut sweep = self.eviction_sweep(max_age_days);
        let evicted = sweep.run().await?;
        if evicted > 0 {
            info!(evicted, max_age_days, cutoff = %sweep.cutoff(), "Evicted expired messages");
        } else {
            debug!(max_age_days, "No expired messages to evict");
        }
        Ok(evicted)
    }

    /// Abandon outbox items already at or past the retry ceiling.
    pub async fn evict_abandoned_outbox_items(&self) -> RetentionResult<usize> {
        let exhausted = self
            .store
            .outbox_items_at_or_past(self.policy.max_attempts)
            .await?;

        let mut abandoned = 0;
        for item in exhausted {
            if self.store.abandon_outbox_item(&item.cid).await? {
                warn!(cid = %item.cid, attempt = item.attempt, "Abandoned exhausted outbox item");
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }

    pub async fn storage_usage(&self) -> RetentionResult<StorageUsage> {
        Ok(self.store.storage_usage().await?)
    }

    /// One full cleanup pass.
    pub async fn sweep(&self, max_age_days: u32) -> RetentionResult<SweepReport> {
        let abandoned_items = self.evict_abandoned_outbox_items().await?;
        let evicted_messages = self.evict_old_messages(max_age_days).await?;
        Ok(SweepReport {
            evicted_messages,
            abandoned_items,
        })
    }

    /// Run [`sweep`](Self::sweep) every `every` until the task is aborted.
    ///
    /// The first pass runs immediately. The task exits if the store becomes
    /// unavailable.
    pub fn spawn_periodic(&self, every: Duration, max_age_days: u32) -> JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                match sweeper.sweep(max_age_days).await {
                    Ok(report) => {
                        debug!(
                            evicted = report.evicted_messages,
                            abandoned = report.abandoned_items,
                            "Cleanup pass finished"
                        );
                    }
                    Err(e) if e.is_unavailable() => {
                        warn!(error = %e, "Store unavailable, stopping cleanup loop");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Cleanup pass failed");
                    }
                }
            }
        })
    }
}
