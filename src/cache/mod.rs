//! Persistent response cache used for offline replay.
//!
//! This module provides the pieces the transport decorator is built from:
//! - Deterministic cache keys derived from method, URL and body
//! - A wire-format record codec for complete HTTP responses
//! - An eligibility filter deciding which responses get persisted
//! - A durable SQLite-backed record store

mod key;
mod policy;
mod record;
mod storage;

pub use key::CacheKey;
pub use policy::Eligibility;
pub use record::{CachedResponse, DecodeError};
pub use storage::{RecordStore, SqliteStorage, StorageError, StoredEntry};
