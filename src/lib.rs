//! feedvault library
//!
//! Continuous market-data collector for a cryptocurrency exchange: stream
//! ingestion with per-pair sequence repair, time-bucketed persistence with
//! rotation, and an at-most-once backup pipeline to object storage.
//! Exposed as a library so the binary and the tests share the same modules.

pub mod backup;
pub mod config;
pub mod control;
pub mod handler;
pub mod manager;
pub mod names;
pub mod rest;
pub mod rotator;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod stream;
pub mod supervisor;
pub mod timebase;

// Re-export the seams most callers need
pub use config::Config;
pub use manager::{CollectionManager, EventSink};
pub use rest::ExchangeApi;
pub use supervisor::Runtime;
