//! Local SQLite record store for CareLink.
//!
//! This crate provides:
//! - `AsyncDatabase`: a single-thread async SQLite executor
//! - Ordered, transactional schema migrations
//! - Model types for messages, rooms, memberships, outbox items, media
//!   blobs and read receipts
//! - `RecordStore`: typed operations that keep the message/outbox pairing
//!   consistent inside single transactions
//!
//! ```ignore
//! let store = RecordStore::open(&paths.database_file()).await?;
//! let merged = store.insert_message(new_message, MessageStatus::Ack).await?;
//! ```

mod error;
mod executor;
pub mod migrations;
mod models;
pub mod queries;
mod store;

pub use error::{StoreError, StoreResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, Migration, MIGRATIONS};
pub use models::*;
pub use store::RecordStore;
