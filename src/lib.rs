//! HTTP transport decorator that records responses for offline replay.
//!
//! [`OfflineTransport`] wraps any [`Transport`] (typically a
//! [`reqwest::Client`]) and stores every eligible response in a persistent
//! SQLite-backed cache. When the network fails, or when the cache is
//! preferred, previously seen requests are answered from the cache.
//!
//! ```no_run
//! use offline_http::{OfflineTransport, Options, SqliteStorage, Transport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let transport = OfflineTransport::open(
//!   reqwest::Client::new(),
//!   &SqliteStorage::default_dir(),
//!   Options::default(),
//! )?;
//!
//! let request = reqwest::Client::new().get("https://example.com/").build()?;
//! let response = transport.execute(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
mod error;
pub mod transport;

pub use cache::{CacheKey, CachedResponse, Eligibility, RecordStore, SqliteStorage};
pub use config::Config;
pub use error::{BoxError, Error};
pub use transport::{default_transport, install_default, OfflineTransport, Options, Transport};
