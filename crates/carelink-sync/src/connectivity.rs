//! Connectivity sources for the sync manager.

use crate::ChatApi;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Reports whether the chat server is reachable.
pub trait ConnectivitySource: Send + Sync {
    fn current(&self) -> bool;

    /// Receiver that sees every change after the call.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by the host (OS network events) or by tests.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Publish a new state. Repeating the current state notifies nobody.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn current(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Connectivity inferred by polling the server's health endpoint.
pub struct ProbeConnectivity {
    tx: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ProbeConnectivity {
    /// Start probing every `every`. The first probe runs immediately; until
    /// it answers the server is assumed unreachable.
    pub fn start(api: Arc<dyn ChatApi>, every: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        let tx = Arc::new(tx);
        let probe_tx = Arc::clone(&tx);

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = api.health().await.is_ok();
                let changed = probe_tx.send_if_modified(|current| {
                    if *current == online {
                        return false;
                    }
                    *current = online;
                    true
                });
                if changed {
                    info!(online, "Server connectivity changed");
                }
            }
        });

        Self { tx, task }
    }
}

impl ConnectivitySource for ProbeConnectivity {
    fn current(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Drop for ProbeConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApiError, ApiResult, MessageAck};
    use async_trait::async_trait;
    use carelink_store::{NewMessage, NewRoom};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct HealthOnly {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl ChatApi for HealthOnly {
        async fn create_message(&self, _: &serde_json::Value) -> ApiResult<MessageAck> {
            Err(ApiError::Rejected("unused".into()))
        }
        async fn list_rooms(&self) -> ApiResult<Vec<NewRoom>> {
            Ok(Vec::new())
        }
        async fn create_room(&self, room: &NewRoom) -> ApiResult<NewRoom> {
            Ok(room.clone())
        }
        async fn list_room_messages(&self, _: &str) -> ApiResult<Vec<NewMessage>> {
            Ok(Vec::new())
        }
        async fn health(&self) -> ApiResult<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ApiError::Status {
                    status: 503,
                    message: "down".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_manual_connectivity_notifies_on_change_only() {
        let source = ManualConnectivity::new(false);
        let mut rx = source.subscribe();

        source.set_online(false);
        assert!(!rx.has_changed().unwrap());

        source.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(source.current());
    }

    #[tokio::test]
    async fn test_probe_follows_health_endpoint() {
        let api = Arc::new(HealthOnly {
            healthy: AtomicBool::new(true),
        });
        let probe = ProbeConnectivity::start(api.clone(), Duration::from_millis(10));
        let mut rx = probe.subscribe();

        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| *online))
            .await
            .unwrap()
            .unwrap();
        assert!(probe.current());

        api.healthy.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| !*online))
            .await
            .unwrap()
            .unwrap();
        assert!(!probe.current());
    }
}
