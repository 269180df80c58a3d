//! Composition root: builds the store, outbox, sync manager and sweeper
//! from configuration and runs the requested command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use carelink_core::{Clock, Config, Paths, SystemClock};
use carelink_outbox::{OutboxQueue, RetryPolicy};
use carelink_retention::CleanupSweeper;
use carelink_store::{MessageContent, NewMessage, RecordStore};
use carelink_sync::{
    ChatApi, ConnectivitySource, HttpChatApi, ManualConnectivity, ProbeConnectivity, SyncConfig,
    SyncManager, SyncOutcome,
};
use tracing::{info, warn};

/// Long-lived components shared by every command.
struct Components {
    store: RecordStore,
    outbox: OutboxQueue,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Components {
    async fn open(config: &Config, paths: &Paths) -> anyhow::Result<Self> {
        let db_path = paths.database_file();
        let store = RecordStore::open(&db_path)
            .await
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let policy = RetryPolicy::from(&config.outbox);
        let outbox = OutboxQueue::new(store.clone(), policy.clone(), clock.clone());
        Ok(Self {
            store,
            outbox,
            policy,
            clock,
        })
    }

    fn sweeper(&self) -> CleanupSweeper {
        CleanupSweeper::new(self.store.clone(), self.policy.clone(), self.clock.clone())
    }

    fn sync_manager(
        &self,
        config: &Config,
        api: Arc<dyn ChatApi>,
        connectivity: Arc<dyn ConnectivitySource>,
    ) -> SyncManager {
        SyncManager::new(
            self.store.clone(),
            self.outbox.clone(),
            api,
            connectivity,
            self.clock.clone(),
            SyncConfig::from(&config.sync),
        )
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Follow connectivity and sweep on schedule until Ctrl-C.
pub async fn run(config: Config, paths: Paths) -> anyhow::Result<()> {
    let components = Components::open(&config, &paths).await?;
    let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::from_config(&config)?);
    let probe = Arc::new(ProbeConnectivity::start(
        api.clone(),
        Duration::from_secs(config.sync.probe_interval_secs.max(1)),
    ));

    let manager = Arc::new(components.sync_manager(&config, api, probe.clone()));
    let _observer = manager.subscribe(|status| {
        info!(
            state = status.state.as_str(),
            pending = status.pending_changes,
            error = status.last_error.as_deref().unwrap_or(""),
            "Sync status"
        );
    });
    let sync_task = manager.start();

    let sweep_task = components.sweeper().spawn_periodic(
        Duration::from_secs(config.retention.sweep_interval_secs.max(1)),
        config.retention.max_message_age_days,
    );

    info!(
        server = %config.server_url,
        db = %components.store.path(),
        "CareLink running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    manager.go_offline();
    sync_task.abort();
    sweep_task.abort();
    drop(probe);
    components.store.close().await?;
    Ok(())
}

/// One sync pass against the configured server.
pub async fn sync_once(config: Config, paths: Paths) -> anyhow::Result<()> {
    let components = Components::open(&config, &paths).await?;
    let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::from_config(&config)?);

    let online = match api.health().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Server unreachable");
            false
        }
    };
    let manager = components.sync_manager(&config, api, Arc::new(ManualConnectivity::new(online)));

    match manager.sync_all().await? {
        SyncOutcome::Completed(report) | SyncOutcome::PartialFailure(report) => {
            print_json(&report)?;
        }
        other => println!("{other:?}"),
    }
    print_json(&manager.status())?;
    components.store.close().await?;
    Ok(())
}

pub async fn sweep(config: Config, paths: Paths, max_age_days: Option<u32>) -> anyhow::Result<()> {
    let components = Components::open(&config, &paths).await?;
    let max_age_days = max_age_days.unwrap_or(config.retention.max_message_age_days);

    let report = components.sweeper().sweep(max_age_days).await?;
    println!(
        "evicted {} messages, abandoned {} outbox items",
        report.evicted_messages, report.abandoned_items
    );
    components.store.close().await?;
    Ok(())
}

pub async fn status(config: Config, paths: Paths) -> anyhow::Result<()> {
    let components = Components::open(&config, &paths).await?;
    let usage = components.store.storage_usage().await?;
    let schema_version = components.store.schema_version().await?;

    print_json(&serde_json::json!({
        "database": components.store.path(),
        "schemaVersion": schema_version,
        "outboxDepth": usage.outbox_items,
        "usage": usage,
    }))?;
    components.store.close().await?;
    Ok(())
}

/// Opening the store applies pending migrations.
pub async fn migrate(paths: Paths, rollback_to: Option<i64>) -> anyhow::Result<()> {
    let store = RecordStore::open(&paths.database_file()).await?;
    if let Some(target) = rollback_to {
        let reverted = store.rollback_schema_to(target).await?;
        info!(reverted, target, "Schema rolled back");
    }
    println!("schema version {}", store.schema_version().await?);
    store.close().await?;
    Ok(())
}

pub async fn send(
    config: Config,
    paths: Paths,
    room: String,
    sender: String,
    text: String,
) -> anyhow::Result<()> {
    let components = Components::open(&config, &paths).await?;
    let message = NewMessage::compose(
        room,
        sender,
        MessageContent::text(text),
        components.clock.now(),
    );
    let staged = components.outbox.stage_message(message).await?;
    println!("{}", staged.record.cid);
    components.store.close().await?;
    Ok(())
}

pub async fn retry(config: Config, paths: Paths, cid: String) -> anyhow::Result<()> {
    let components = Components::open(&config, &paths).await?;
    let item = components.outbox.retry_failed(&cid).await?;
    println!("{} queued in {}", item.cid, item.room_id);
    components.store.close().await?;
    Ok(())
}
