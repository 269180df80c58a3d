//! Database migrations.
//!
//! Migrations are an ordered list tracked in the `migrations` table. Each
//! one commits together with its tracking row, so the recorded version never
//! runs ahead of the schema.

use crate::{StoreError, StoreResult};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

/// A single schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

/// Every migration, in application order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "rooms_messages_memberships",
        up: "
            CREATE TABLE rooms (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                is_group INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_message_at INTEGER
            );
            CREATE INDEX idx_rooms_last_message_at ON rooms(last_message_at);

            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                cid TEXT NOT NULL UNIQUE,
                room_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                reply_to TEXT,
                reactions TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX idx_messages_room_time ON messages(room_id, created_at);
            CREATE INDEX idx_messages_status ON messages(status);
            CREATE INDEX idx_messages_kind ON messages(kind);
            CREATE INDEX idx_messages_time_id ON messages(created_at, id);

            CREATE TABLE memberships (
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );
            CREATE INDEX idx_memberships_user ON memberships(user_id);
        ",
        down: "
            DROP TABLE IF EXISTS memberships;
            DROP TABLE IF EXISTS messages;
            DROP TABLE IF EXISTS rooms;
        ",
    },
    Migration {
        version: 2,
        name: "outbox",
        up: "
            CREATE TABLE outbox_items (
                cid TEXT PRIMARY KEY REFERENCES messages(cid) ON DELETE CASCADE,
                room_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX idx_outbox_next_attempt ON outbox_items(next_attempt_at);
        ",
        down: "
            DROP TABLE IF EXISTS outbox_items;
        ",
    },
    Migration {
        version: 3,
        name: "media_and_reads",
        up: "
            CREATE TABLE media_blobs (
                blob_ref TEXT PRIMARY KEY,
                mime_type TEXT NOT NULL,
                data BLOB NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE read_receipts (
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                read_at INTEGER NOT NULL,
                PRIMARY KEY (room_id, user_id, message_id)
            );
            CREATE INDEX idx_read_receipts_message ON read_receipts(message_id);
        ",
        down: "
            DROP TABLE IF EXISTS read_receipts;
            DROP TABLE IF EXISTS media_blobs;
        ",
    },
    Migration {
        version: 4,
        name: "keys_placeholder",
        up: "
            CREATE TABLE keys (
                owner_id TEXT PRIMARY KEY,
                public_key BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );
        ",
        down: "
            DROP TABLE IF EXISTS keys;
        ",
    },
    Migration {
        version: 5,
        name: "outbox_attempt_index",
        up: "
            CREATE INDEX idx_outbox_attempt ON outbox_items(attempt);
        ",
        down: "
            DROP INDEX IF EXISTS idx_outbox_attempt;
        ",
    },
];

/// Highest version in [`MIGRATIONS`].
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn ensure_tracking_table(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    Ok(())
}

/// Highest applied version, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<i64> {
    ensure_tracking_table(conn)?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Apply every migration above the recorded version.
///
/// Returns the number of migrations applied.
pub fn run_migrations(conn: &Connection) -> StoreResult<usize> {
    let current = current_version(conn)?;
    let target = latest_version();

    info!(current_version = current, target_version = target, "Running migrations");

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    info!(applied, "Migrations complete");
    Ok(applied)
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(version = migration.version, name = migration.name, "Applying migration");

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.up).map_err(|e| {
        StoreError::Migration(format!(
            "v{} {} failed: {}",
            migration.version, migration.name, e
        ))
    })?;
    tx.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        params![migration.version, migration.name],
    )?;
    tx.commit()?;

    debug!(version = migration.version, name = migration.name, "Migration applied");
    Ok(())
}

/// Revert applied migrations down to (and excluding) `target`.
///
/// Development only; nothing in the runtime path calls this.
pub fn rollback_to(conn: &Connection, target: i64) -> StoreResult<usize> {
    let current = current_version(conn)?;
    if target >= current {
        return Ok(0);
    }

    warn!(current_version = current, target_version = target, "Rolling back migrations");

    let mut reverted = 0;
    for migration in MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version > target && m.version <= current)
    {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.down).map_err(|e| {
            StoreError::Migration(format!(
                "rollback of v{} {} failed: {}",
                migration.version, migration.name, e
            ))
        })?;
        tx.execute(
            "DELETE FROM migrations WHERE version = ?1",
            params![migration.version],
        )?;
        tx.commit()?;

        info!(version = migration.version, name = migration.name, "Migration reverted");
        reverted += 1;
    }

    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
        assert_eq!(latest_version(), 5);
    }

    #[test]
    fn test_fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = run_migrations(&conn).unwrap();

        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), latest_version());
        for table in [
            "rooms",
            "messages",
            "memberships",
            "outbox_items",
            "media_blobs",
            "read_receipts",
            "keys",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn test_rerun_is_a_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 0);

        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(recorded, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_resumes_from_partial_schema() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_tracking_table(&conn).unwrap();
        apply(&conn, &MIGRATIONS[0]).unwrap();
        apply(&conn, &MIGRATIONS[1]).unwrap();

        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len() - 2);
        assert!(table_exists(&conn, "keys"));
    }

    #[test]
    fn test_failed_migration_leaves_version_untouched() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let broken = Migration {
            version: 99,
            name: "broken",
            up: "CREATE TABLE half_done (id TEXT); THIS IS NOT SQL;",
            down: "",
        };
        assert!(matches!(apply(&conn, &broken), Err(StoreError::Migration(_))));
        assert_eq!(current_version(&conn).unwrap(), latest_version());
        assert!(!table_exists(&conn, "half_done"));
    }

    #[test]
    fn test_rollback_reverts_in_reverse_order() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let reverted = rollback_to(&conn, 2).unwrap();
        assert_eq!(reverted, 3);
        assert_eq!(current_version(&conn).unwrap(), 2);
        assert!(table_exists(&conn, "outbox_items"));
        assert!(!table_exists(&conn, "media_blobs"));
        assert!(!table_exists(&conn, "keys"));

        // Re-applying brings the schema back.
        assert_eq!(run_migrations(&conn).unwrap(), 3);
        assert!(table_exists(&conn, "keys"));
    }

    #[test]
    fn test_rollback_to_current_or_above_is_a_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(rollback_to(&conn, latest_version()).unwrap(), 0);
        assert_eq!(rollback_to(&conn, 100).unwrap(), 0);
    }
}
