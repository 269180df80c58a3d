//! End-to-end flows across the store, outbox, sync manager, realtime merger
//! and sweeper, against an in-process fake chat server.

use async_trait::async_trait;
use carelink_core::ManualClock;
use carelink_outbox::{OutboxQueue, RetryPolicy};
use carelink_realtime::{ChannelFeed, FeedEvent, RealtimeMerger, Topic};
use carelink_retention::CleanupSweeper;
use carelink_store::{MessageContent, MessageStatus, NewMessage, NewRoom, RecordStore};
use carelink_sync::{
    ApiError, ApiResult, ChatApi, ManualConnectivity, MessageAck, SyncConfig, SyncManager,
    SyncOutcome, SyncState,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn room(id: &str) -> NewRoom {
    NewRoom {
        id: id.to_string(),
        title: format!("Room {id}"),
        is_group: true,
        created_at: at(0),
        last_message_at: None,
    }
}

fn text(cid: &str, room_id: &str, secs: i64) -> NewMessage {
    let mut message = NewMessage::compose(room_id, "u1", MessageContent::text(cid), at(secs));
    message.cid = cid.to_string();
    message
}

/// Chat server that stores what it accepts, keyed by cid.
#[derive(Default)]
struct FakeServer {
    down: AtomicBool,
    rooms: Mutex<Vec<NewRoom>>,
    messages: Mutex<HashMap<String, Vec<NewMessage>>>,
}

impl FakeServer {
    fn with_rooms(rooms: &[&str]) -> Self {
        let server = Self::default();
        *server.rooms.lock() = rooms.iter().map(|id| room(id)).collect();
        server
    }

    fn check_up(&self) -> ApiResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                message: "maintenance".to_string(),
            });
        }
        Ok(())
    }

    fn stored_cids(&self, room_id: &str) -> Vec<String> {
        self.messages
            .lock()
            .get(room_id)
            .map(|messages| messages.iter().map(|m| m.cid.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatApi for FakeServer {
    async fn create_message(&self, payload: &serde_json::Value) -> ApiResult<MessageAck> {
        self.check_up()?;
        let message: NewMessage = serde_json::from_value(payload.clone())?;
        let mut messages = self.messages.lock();
        let room = messages.entry(message.room_id.clone()).or_default();
        if !room.iter().any(|m| m.cid == message.cid) {
            room.push(message.clone());
        }
        Ok(MessageAck {
            cid: Some(message.cid),
            id: None,
        })
    }

    async fn list_rooms(&self) -> ApiResult<Vec<NewRoom>> {
        self.check_up()?;
        Ok(self.rooms.lock().clone())
    }

    async fn create_room(&self, room: &NewRoom) -> ApiResult<NewRoom> {
        self.check_up()?;
        self.rooms.lock().push(room.clone());
        Ok(room.clone())
    }

    async fn list_room_messages(&self, room_id: &str) -> ApiResult<Vec<NewMessage>> {
        self.check_up()?;
        Ok(self.messages.lock().get(room_id).cloned().unwrap_or_default())
    }

    async fn health(&self) -> ApiResult<()> {
        self.check_up()
    }
}

struct Harness {
    store: RecordStore,
    clock: Arc<ManualClock>,
    server: Arc<FakeServer>,
    connectivity: Arc<ManualConnectivity>,
    manager: Arc<SyncManager>,
}

impl Harness {
    async fn new(server: FakeServer, online: bool) -> Self {
        let store = RecordStore::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(at(0)));
        let server = Arc::new(server);
        let connectivity = Arc::new(ManualConnectivity::new(online));
        let outbox = OutboxQueue::new(store.clone(), RetryPolicy::default(), clock.clone());
        let manager = Arc::new(SyncManager::new(
            store.clone(),
            outbox,
            server.clone(),
            connectivity.clone(),
            clock.clone(),
            SyncConfig {
                fetch_attempts: 1,
                fetch_retry_delay: Duration::from_millis(1),
                ..SyncConfig::default()
            },
        ));
        Self {
            store,
            clock,
            server,
            connectivity,
            manager,
        }
    }

    async fn go_online(&self) -> SyncOutcome {
        self.connectivity.set_online(true);
        self.manager.handle_connectivity(true).await.unwrap()
    }

    /// Every message awaiting delivery has exactly one outbox item and no
    /// other message has one.
    async fn assert_outbox_complete(&self) {
        let items = self.store.list_outbox_items().await.unwrap();
        for room in self.store.list_rooms().await.unwrap() {
            for message in self.store.get_messages_by_room(&room.id).await.unwrap() {
                let queued = items.iter().filter(|i| i.cid == message.cid).count();
                let expected = usize::from(message.status.awaits_delivery());
                assert_eq!(
                    queued, expected,
                    "message {} in {:?} has {queued} outbox items",
                    message.cid, message.status
                );
            }
        }
        for item in &items {
            assert!(self.store.get_message_by_cid(&item.cid).await.unwrap().is_some());
        }
    }
}

#[tokio::test]
async fn offline_message_is_delivered_on_reconnect() {
    let h = Harness::new(FakeServer::with_rooms(&["R"]), false).await;
    h.store.insert_room(room("R")).await.unwrap();

    h.manager
        .outbox()
        .stage_message(text("c1", "R", 1))
        .await
        .unwrap();
    assert_eq!(h.manager.outbox().len().await.unwrap(), 1);
    assert_eq!(h.manager.sync_all().await.unwrap(), SyncOutcome::Offline);

    let outcome = h.go_online().await;
    assert!(matches!(outcome, SyncOutcome::Completed(_)), "{outcome:?}");

    assert!(h.manager.outbox().is_empty().await.unwrap());
    let m1 = h.store.get_message_by_cid("c1").await.unwrap().unwrap();
    assert_eq!(m1.status, MessageStatus::Ack);
    assert_eq!(h.server.stored_cids("R"), vec!["c1".to_string()]);
    assert_eq!(h.manager.state(), SyncState::OnlineIdle);
    // The pull that ran alongside brought back the same message; still one copy.
    assert_eq!(h.store.get_messages_by_room("R").await.unwrap().len(), 1);
    h.assert_outbox_complete().await;
}

#[tokio::test]
async fn five_network_failures_abandon_the_message() {
    let h = Harness::new(FakeServer::default(), true).await;
    h.server.down.store(true, Ordering::SeqCst);
    h.store.insert_room(room("R")).await.unwrap();
    h.manager
        .outbox()
        .stage_message(text("c2", "R", 1))
        .await
        .unwrap();

    for failure in 1..=5u32 {
        let outcome = h.manager.sync_all().await.unwrap();
        let SyncOutcome::PartialFailure(report) = outcome else {
            panic!("failure {failure} should not complete: {outcome:?}");
        };
        if failure < 5 {
            assert_eq!(report.outbound.failed, 1);
            let item = h.store.get_outbox_item("c2").await.unwrap().unwrap();
            assert_eq!(item.attempt, failure);
            h.clock.set(item.next_attempt_at);
        } else {
            assert_eq!(report.outbound.abandoned, 1);
        }
        assert_eq!(h.manager.state(), SyncState::SyncError);
    }

    assert!(h.store.get_outbox_item("c2").await.unwrap().is_none());
    let m2 = h.store.get_message_by_cid("c2").await.unwrap().unwrap();
    assert_eq!(m2.status, MessageStatus::Failed);
    assert_eq!(h.manager.status().pending_changes, 0);
    h.assert_outbox_complete().await;

    h.server.down.store(false, Ordering::SeqCst);
    h.manager.outbox().retry_failed("c2").await.unwrap();
    assert!(matches!(
        h.manager.sync_all().await.unwrap(),
        SyncOutcome::Completed(_)
    ));
    assert_eq!(
        h.store.get_message_by_cid("c2").await.unwrap().unwrap().status,
        MessageStatus::Ack
    );
}

#[tokio::test]
async fn zero_day_sweep_empties_the_room() {
    let h = Harness::new(FakeServer::default(), true).await;
    for i in 0..10 {
        h.store
            .insert_message(text(&format!("m{i}"), "R", i), MessageStatus::Ack)
            .await
            .unwrap();
    }
    h.clock.set(at(3600));

    let sweeper = CleanupSweeper::new(h.store.clone(), RetryPolicy::default(), h.clock.clone());
    assert_eq!(sweeper.evict_old_messages(0).await.unwrap(), 10);
    assert!(h
        .store
        .get_messages_page("R", None, 50)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn repeated_pulls_do_not_duplicate() {
    let server = FakeServer::with_rooms(&["R", "S"]);
    server
        .messages
        .lock()
        .insert("R".to_string(), vec![text("s1", "R", 1), text("s2", "R", 2)]);
    let h = Harness::new(server, true).await;

    for _ in 0..3 {
        let outcome = h.manager.sync_all().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)), "{outcome:?}");
    }

    assert_eq!(h.store.list_rooms().await.unwrap().len(), 2);
    let messages = h.store.get_messages_by_room("R").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.status == MessageStatus::Ack));
    h.assert_outbox_complete().await;
}

#[tokio::test]
async fn inbound_failure_keeps_outbound_progress() {
    let h = Harness::new(FakeServer::with_rooms(&["R"]), true).await;
    h.store.insert_room(room("R")).await.unwrap();
    h.manager
        .outbox()
        .stage_message(text("c1", "R", 1))
        .await
        .unwrap();

    // Server goes down after accepting the POST but before the room list.
    struct FlakyRooms(Arc<FakeServer>);

    #[async_trait]
    impl ChatApi for FlakyRooms {
        async fn create_message(&self, payload: &serde_json::Value) -> ApiResult<MessageAck> {
            self.0.create_message(payload).await
        }
        async fn list_rooms(&self) -> ApiResult<Vec<NewRoom>> {
            Err(ApiError::Status {
                status: 502,
                message: "bad gateway".to_string(),
            })
        }
        async fn create_room(&self, room: &NewRoom) -> ApiResult<NewRoom> {
            self.0.create_room(room).await
        }
        async fn list_room_messages(&self, room_id: &str) -> ApiResult<Vec<NewMessage>> {
            self.0.list_room_messages(room_id).await
        }
        async fn health(&self) -> ApiResult<()> {
            Ok(())
        }
    }

    let outbox = OutboxQueue::new(h.store.clone(), RetryPolicy::default(), h.clock.clone());
    let manager = SyncManager::new(
        h.store.clone(),
        outbox,
        Arc::new(FlakyRooms(h.server.clone())),
        h.connectivity.clone(),
        h.clock.clone(),
        SyncConfig {
            fetch_attempts: 2,
            fetch_retry_delay: Duration::from_millis(1),
            ..SyncConfig::default()
        },
    );

    let outcome = manager.sync_all().await.unwrap();
    let SyncOutcome::PartialFailure(report) = outcome else {
        panic!("expected partial failure: {outcome:?}");
    };
    assert_eq!(report.outbound.succeeded, 1);
    assert!(report.inbound.error.is_some());
    assert_eq!(
        h.store.get_message_by_cid("c1").await.unwrap().unwrap().status,
        MessageStatus::Ack
    );
}

#[tokio::test]
async fn concurrent_local_and_realtime_writes_store_one_record() {
    let h = Harness::new(FakeServer::default(), false).await;
    h.store.insert_room(room("R")).await.unwrap();
    let feed = Arc::new(ChannelFeed::new());
    let merger = RealtimeMerger::new(h.store.clone(), feed.clone());
    let (tx, mut merged) = tokio::sync::mpsc::unbounded_channel();
    merger
        .subscribe_to_messages("R", move |m| {
            let _ = tx.send(m.record.cid);
        })
        .await
        .unwrap();

    let mut local = Vec::new();
    for i in 0..20 {
        let cid = format!("x{i}");
        feed.publish(&Topic::messages("R"), FeedEvent::Message(text(&cid, "R", i)));
        let outbox = h.manager.outbox().clone();
        local.push(tokio::spawn(async move {
            outbox.stage_message(text(&cid, "R", i)).await.unwrap()
        }));
    }
    for task in local {
        task.await.unwrap();
    }
    for _ in 0..20 {
        tokio::time::timeout(Duration::from_secs(2), merged.recv())
            .await
            .unwrap()
            .unwrap();
    }

    let messages = h.store.get_messages_by_room("R").await.unwrap();
    assert_eq!(messages.len(), 20);
    h.assert_outbox_complete().await;

    // Whatever is still queued goes out once and settles as ack.
    h.go_online().await;
    for message in h.store.get_messages_by_room("R").await.unwrap() {
        assert_eq!(message.status, MessageStatus::Ack);
    }
    h.assert_outbox_complete().await;
}

#[tokio::test]
async fn outbox_survives_restart_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carelink.sqlite");
    let clock = Arc::new(ManualClock::new(at(0)));

    {
        let store = RecordStore::open(&path).await.unwrap();
        let outbox = OutboxQueue::new(store.clone(), RetryPolicy::default(), clock.clone());
        store.insert_room(room("R")).await.unwrap();
        for i in 0..3 {
            outbox
                .stage_message(text(&format!("c{i}"), "R", i))
                .await
                .unwrap();
        }
        store.close().await.unwrap();
    }

    let store = RecordStore::open(&path).await.unwrap();
    let server = Arc::new(FakeServer::with_rooms(&["R"]));
    let manager = SyncManager::new(
        store.clone(),
        OutboxQueue::new(store.clone(), RetryPolicy::default(), clock.clone()),
        server.clone(),
        Arc::new(ManualConnectivity::new(true)),
        clock,
        SyncConfig::default(),
    );

    let outcome = manager.sync_all().await.unwrap();
    let SyncOutcome::Completed(report) = outcome else {
        panic!("expected clean sync: {outcome:?}");
    };
    assert_eq!(report.outbound.succeeded, 3);
    assert_eq!(server.stored_cids("R").len(), 3);
    assert_eq!(store.outbox_len().await.unwrap(), 0);
}
