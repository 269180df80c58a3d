//! Sync manager: connectivity-driven state machine over outbound delivery
//! and inbound pulls.
//!
//! ```text
//!            connectivity restored
//!  offline ───────────────────────────┐
//!     ▲                               ▼
//!     │ connectivity lost        ┌─────────┐  all clean   ┌─────────────┐
//!     └──────────────────────────│ syncing │─────────────▶│ online-idle │
//!       (from any state)         └─────────┘              └─────────────┘
//!                                  │    ▲     sync_all()        │
//!                    any failure   ▼    └───────────────────────┘
//!                              ┌────────────┐
//!                              │ sync-error │── sync_all() ──▶ syncing
//!                              └────────────┘
//! ```

use crate::{ApiError, ApiResult, ChatApi, ConnectivitySource, SyncResult};
use carelink_core::{Clock, SyncSettings};
use carelink_outbox::{OutboxFailure, OutboxQueue};
use carelink_store::{Merged, MessageStatus, NewRoom, OutboxItem, RecordStore, Room};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Offline,
    OnlineIdle,
    Syncing,
    SyncError,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::OnlineIdle => "online-idle",
            Self::Syncing => "syncing",
            Self::SyncError => "sync-error",
        }
    }
}

/// Result of one sub-sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubSyncReport {
    pub succeeded: usize,
    /// Records that failed this pass and will be retried.
    pub failed: usize,
    /// Outbox items given up on this pass.
    pub abandoned: usize,
    /// First error encountered, if any.
    pub error: Option<String>,
}

impl SubSyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.abandoned == 0 && self.error.is_none()
    }

    fn note_error(&mut self, error: impl std::fmt::Display) {
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub outbound: SubSyncReport,
    pub inbound: SubSyncReport,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.outbound.is_clean() && self.inbound.is_clean()
    }

    fn first_error(&self) -> Option<String> {
        let describe = |side: &str, report: &SubSyncReport| {
            report
                .error
                .as_ref()
                .map(|e| format!("{side}: {e}"))
                .or_else(|| {
                    (!report.is_clean()).then(|| {
                        format!(
                            "{side}: {} failed, {} abandoned",
                            report.failed, report.abandoned
                        )
                    })
                })
        };
        describe("outbound", &self.outbound).or_else(|| describe("inbound", &self.inbound))
    }
}

/// Snapshot published to observers on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_changes: u64,
    pub last_error: Option<String>,
    pub last_report: Option<SyncReport>,
}

impl SyncStatus {
    fn new(online: bool) -> Self {
        Self {
            state: if online {
                SyncState::OnlineIdle
            } else {
                SyncState::Offline
            },
            last_sync: None,
            pending_changes: 0,
            last_error: None,
            last_report: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Both sub-syncs finished clean.
    Completed(SyncReport),
    /// At least one sub-sync reported failures; the rest was kept.
    PartialFailure(SyncReport),
    /// Another sync was in flight; nothing was done.
    AlreadyRunning,
    /// The manager is offline; nothing was done.
    Offline,
    /// Connectivity was lost mid-sync.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempts per server fetch before the fetch counts as failed.
    pub fetch_attempts: u32,
    /// Delay before the first fetch retry; doubles each retry.
    pub fetch_retry_delay: Duration,
    /// Period of the background sync run by [`SyncManager::start`].
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_attempts: 3,
            fetch_retry_delay: Duration::from_millis(500),
            sync_interval: Duration::from_secs(30),
        }
    }
}

impl From<&SyncSettings> for SyncConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            fetch_attempts: settings.fetch_attempts.max(1),
            fetch_retry_delay: Duration::from_millis(settings.fetch_retry_delay_ms),
            sync_interval: Duration::from_secs(settings.sync_interval_secs.max(1)),
        }
    }
}

type Observer = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

#[derive(Default)]
struct ObserverRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Observer)>>,
}

impl ObserverRegistry {
    fn notify(&self, status: &SyncStatus) {
        let observers: Vec<Observer> = self
            .entries
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(status);
        }
    }
}

/// Registration returned by [`SyncManager::subscribe`].
pub struct ObserverHandle {
    id: u64,
    registry: Weak<ObserverRegistry>,
}

impl ObserverHandle {
    /// Stop receiving updates. Returns false if already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut entries = registry.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _)| *id != self.id);
        entries.len() != before
    }
}

/// Clears the in-flight flag when the owning sync ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Delivery {
    Delivered,
    AlreadyResolved,
    Failed(OutboxFailure),
}

/// Coordinates outbound delivery and inbound pulls.
///
/// One instance per store, owned by the application and shared as
/// `Arc<SyncManager>`.
pub struct SyncManager {
    store: RecordStore,
    outbox: OutboxQueue,
    api: Arc<dyn ChatApi>,
    connectivity: Arc<dyn ConnectivitySource>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    status: Mutex<SyncStatus>,
    observers: Arc<ObserverRegistry>,
    in_flight: AtomicBool,
    cancel: broadcast::Sender<()>,
}

impl SyncManager {
    pub fn new(
        store: RecordStore,
        outbox: OutboxQueue,
        api: Arc<dyn ChatApi>,
        connectivity: Arc<dyn ConnectivitySource>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let (cancel, _) = broadcast::channel(8);
        let status = SyncStatus::new(connectivity.current());
        Self {
            store,
            outbox,
            api,
            connectivity,
            clock,
            config,
            status: Mutex::new(status),
            observers: Arc::new(ObserverRegistry::default()),
            in_flight: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    pub fn state(&self) -> SyncState {
        self.status.lock().state
    }

    pub fn outbox(&self) -> &OutboxQueue {
        &self.outbox
    }

    /// Register an observer called on every status change.
    pub fn subscribe<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.observers.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.entries.lock().push((id, Arc::new(observer)));
        ObserverHandle {
            id,
            registry: Arc::downgrade(&self.observers),
        }
    }

    /// Apply `update` and publish the result. Observers run after the status
    /// lock is released. Returns whether `update` changed anything.
    fn transition<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut SyncStatus) -> bool,
    {
        let snapshot = {
            let mut status = self.status.lock();
            let from = status.state;
            if !update(&mut status) {
                return false;
            }
            debug!(from = from.as_str(), to = status.state.as_str(), "Sync state transition");
            status.clone()
        };
        self.observers.notify(&snapshot);
        true
    }

    /// React to a connectivity change.
    pub async fn handle_connectivity(&self, online: bool) -> SyncResult<SyncOutcome> {
        if online {
            self.go_online().await
        } else {
            self.go_offline();
            Ok(SyncOutcome::Offline)
        }
    }

    /// Cancel any in-flight sync and move to `offline`.
    pub fn go_offline(&self) {
        // State first: a sync that starts after this sees `offline`, one that
        // started before has already subscribed and gets the cancel.
        self.transition(|status| {
            if status.state == SyncState::Offline {
                return false;
            }
            status.state = SyncState::Offline;
            true
        });
        // No receivers just means nothing is in flight.
        let _ = self.cancel.send(());
        info!("Sync manager offline");
    }

    /// Leave `offline` and sync straight away.
    pub async fn go_online(&self) -> SyncResult<SyncOutcome> {
        if self.state() != SyncState::Offline {
            return self.sync_all().await;
        }

        let cancel = self.cancel.subscribe();
        let Some(guard) = InFlightGuard::acquire(&self.in_flight) else {
            // A cancelled sync has not unwound yet. Its work is left for the
            // next scheduled sync.
            self.transition(|status| {
                if status.state != SyncState::Offline {
                    return false;
                }
                status.state = SyncState::OnlineIdle;
                true
            });
            return Ok(SyncOutcome::AlreadyRunning);
        };
        info!("Connectivity restored, syncing");
        self.run_sync(guard, cancel, true).await
    }

    /// Run outbound and inbound sync once.
    pub async fn sync_all(&self) -> SyncResult<SyncOutcome> {
        let cancel = self.cancel.subscribe();
        if self.state() == SyncState::Offline {
            debug!("Sync requested while offline");
            return Ok(SyncOutcome::Offline);
        }
        let Some(guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Sync already in flight");
            return Ok(SyncOutcome::AlreadyRunning);
        };
        self.run_sync(guard, cancel, false).await
    }

    /// `cancel` must be subscribed before the caller last read the state.
    async fn run_sync(
        &self,
        _guard: InFlightGuard<'_>,
        mut cancel: broadcast::Receiver<()>,
        leaving_offline: bool,
    ) -> SyncResult<SyncOutcome> {
        let started = self.transition(|status| {
            if status.state == SyncState::Offline && !leaving_offline {
                return false;
            }
            status.state = SyncState::Syncing;
            true
        });
        if !started {
            debug!("Went offline before sync started");
            return Ok(SyncOutcome::Offline);
        }

        let work = async { tokio::join!(self.drain_outbox(), self.pull_inbound()) };
        let (outbound, inbound) = tokio::select! {
            biased;
            _ = cancel.recv() => {
                info!("Sync cancelled");
                // Connectivity dropped between the caller's check and the
                // start of this sync.
                self.transition(|status| {
                    if status.state != SyncState::Syncing {
                        return false;
                    }
                    status.state = SyncState::Offline;
                    true
                });
                return Ok(SyncOutcome::Cancelled);
            }
            results = work => results,
        };

        let mut fatal = None;
        let mut settle = |result: SyncResult<SubSyncReport>| match result {
            Ok(report) => report,
            Err(e) => {
                let mut report = SubSyncReport::default();
                report.note_error(&e);
                fatal.get_or_insert(e);
                report
            }
        };
        let report = SyncReport {
            outbound: settle(outbound),
            inbound: settle(inbound),
        };

        let now = self.clock.now();
        let outcome = if report.is_clean() {
            info!(
                delivered = report.outbound.succeeded,
                pulled = report.inbound.succeeded,
                "Sync completed"
            );
            let last_report = report.clone();
            self.transition(move |status| {
                if status.state != SyncState::Syncing {
                    return false;
                }
                status.state = SyncState::OnlineIdle;
                status.last_sync = Some(now);
                status.pending_changes = 0;
                status.last_error = None;
                status.last_report = Some(last_report);
                true
            });
            SyncOutcome::Completed(report)
        } else {
            let pending = match self.outbox.len().await {
                Ok(len) => Some(len),
                Err(e) => {
                    warn!(error = %e, "Failed to count outbox after sync");
                    None
                }
            };
            let error = report.first_error();
            warn!(error = error.as_deref().unwrap_or_default(), "Sync finished with failures");
            let last_report = report.clone();
            self.transition(move |status| {
                if status.state != SyncState::Syncing {
                    return false;
                }
                status.state = SyncState::SyncError;
                if let Some(pending) = pending {
                    status.pending_changes = pending;
                }
                status.last_error = error;
                status.last_report = Some(last_report);
                true
            });
            SyncOutcome::PartialFailure(report)
        };

        match fatal {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Deliver every due outbox item. Items settle independently.
    async fn drain_outbox(&self) -> SyncResult<SubSyncReport> {
        let mut report = SubSyncReport::default();
        let due = match self.outbox.pending().await {
            Ok(items) => items,
            Err(e) if e.is_unavailable() => return Err(e.into()),
            Err(e) => {
                report.note_error(&e);
                return Ok(report);
            }
        };

        for item in due {
            match self.deliver(&item).await {
                Ok(Delivery::Delivered) => report.succeeded += 1,
                Ok(Delivery::AlreadyResolved) => {}
                Ok(Delivery::Failed(OutboxFailure::Rescheduled { .. })) => report.failed += 1,
                Ok(Delivery::Failed(OutboxFailure::Abandoned { .. })) => report.abandoned += 1,
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    warn!(cid = %item.cid, error = %e, "Outbox item could not be settled");
                    report.failed += 1;
                    report.note_error(&e);
                }
            }
        }
        Ok(report)
    }

    async fn deliver(&self, item: &OutboxItem) -> SyncResult<Delivery> {
        self.outbox.mark_sending(&item.cid).await?;

        let result = self
            .api
            .create_message(&item.payload)
            .await
            .and_then(|ack| match ack.cid {
                Some(cid) if cid != item.cid => Err(ApiError::Rejected(format!(
                    "server acknowledged {cid} for {}",
                    item.cid
                ))),
                _ => Ok(()),
            });

        match result {
            Ok(()) => {
                if self.outbox.record_success(&item.cid).await? {
                    debug!(cid = %item.cid, "Message delivered");
                    Ok(Delivery::Delivered)
                } else {
                    Ok(Delivery::AlreadyResolved)
                }
            }
            Err(e) => {
                warn!(cid = %item.cid, attempt = item.attempt + 1, error = %e, "Message delivery failed");
                match self.outbox.record_failure(&item.cid, &e.to_string()).await? {
                    Some(failure) => Ok(Delivery::Failed(failure)),
                    None => Ok(Delivery::AlreadyResolved),
                }
            }
        }
    }

    /// Pull rooms, then each room's messages, into the store as `ack`.
    async fn pull_inbound(&self) -> SyncResult<SubSyncReport> {
        let mut report = SubSyncReport::default();

        let rooms = match self.fetch_with_retry("rooms", || self.api.list_rooms()).await {
            Ok(rooms) => rooms,
            Err(e) => {
                report.failed += 1;
                report.note_error(&e);
                return Ok(report);
            }
        };

        for room in rooms {
            match self.store.insert_room(room.clone()).await {
                Ok(_) => report.succeeded += 1,
                Err(e) if e.is_unavailable() => return Err(e.into()),
                Err(e) => {
                    warn!(room_id = %room.id, error = %e, "Failed to store pulled room");
                    report.failed += 1;
                    report.note_error(&e);
                }
            }

            let messages = match self
                .fetch_with_retry("room messages", || self.api.list_room_messages(&room.id))
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    report.failed += 1;
                    report.note_error(format!("room {}: {e}", room.id));
                    continue;
                }
            };

            for message in messages {
                let cid = message.cid.clone();
                match self.store.insert_message(message, MessageStatus::Ack).await {
                    Ok(_) => report.succeeded += 1,
                    Err(e) if e.is_unavailable() => return Err(e.into()),
                    Err(e) => {
                        warn!(cid = %cid, room_id = %room.id, error = %e, "Failed to store pulled message");
                        report.failed += 1;
                        report.note_error(&e);
                    }
                }
            }
        }

        debug!(
            stored = report.succeeded,
            failed = report.failed,
            "Inbound pull finished"
        );
        Ok(report)
    }

    /// Retry transient fetch failures with doubling delay.
    async fn fetch_with_retry<T, F, Fut>(&self, what: &str, mut fetch: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let attempts = self.config.fetch_attempts.max(1);
        let mut delay = self.config.fetch_retry_delay;
        let mut attempt = 1;
        loop {
            match fetch().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && e.is_transient() => {
                    debug!(what, attempt, error = %e, "Fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(what, attempt, error = %e, "Fetch failed");
                    return Err(e);
                }
            }
        }
    }

    /// Create a room on the server and store the server's copy.
    pub async fn publish_room(&self, room: NewRoom) -> SyncResult<Merged<Room>> {
        let created = self.api.create_room(&room).await?;
        let merged = self.store.insert_room(created).await?;
        info!(room_id = %merged.record.id, "Room published");
        Ok(merged)
    }

    /// Follow the connectivity source until it goes away, and sync every
    /// `sync_interval` while connected.
    ///
    /// The first tick fires at once, so an outbox left over from a previous
    /// run drains on start. Ticks also pick up items whose backoff has
    /// elapsed and messages queued by other processes. Going offline is
    /// applied inline so it can cancel a running sync; syncs run on their
    /// own tasks.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = manager.connectivity.subscribe();

        tokio::spawn(async move {
            let mut online = *rx.borrow_and_update();
            if online != (manager.state() != SyncState::Offline) {
                manager.apply_connectivity(online);
            }

            let mut ticker = interval(manager.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = *rx.borrow_and_update();
                        if next != online {
                            online = next;
                            manager.apply_connectivity(online);
                        }
                    }
                    _ = ticker.tick() => {
                        if manager.state() != SyncState::Offline {
                            manager.spawn_sync();
                        }
                    }
                }
            }
            debug!("Connectivity source closed");
        })
    }

    fn spawn_sync(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.sync_all().await {
                warn!(error = %e, "Scheduled sync failed");
            }
        });
    }

    fn apply_connectivity(self: &Arc<Self>, online: bool) {
        if !online {
            self.go_offline();
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.go_online().await {
                warn!(error = %e, "Sync after reconnect failed");
            }
        });
    }
}
