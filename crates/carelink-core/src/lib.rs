//! Shared configuration, paths, clock and logging for CareLink.

mod clock;
mod config;
mod error;
mod logging;
mod paths;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    Config, OutboxSettings, RetentionSettings, SyncSettings, DEFAULT_LOG_LEVEL, DEFAULT_SERVER_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, LogFileWriter};
pub use paths::Paths;
