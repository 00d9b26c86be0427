#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod config;
mod error;
/// Row and payload types for the job store.
pub mod schema;
mod shutdown;
mod storage;
mod supervisor;
mod util;
mod worker;

/// Typed configuration over the store.
pub use self::config::{Config, Settings};
/// Error type and result alias shared across the crate.
pub use self::error::{Error, Result};
/// Signal handling for graceful shutdown.
pub use self::shutdown::install_shutdown_handler;
/// The durable job store.
pub use self::storage::Store;
/// The worker pool owner.
pub use self::supervisor::Supervisor;
/// Canonical storage timestamps.
pub use self::util::{now_ts, now_utc};
/// The job execution loop.
pub use self::worker::Worker;
