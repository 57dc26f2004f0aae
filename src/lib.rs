//! # chunkstore
//!
//! Chunked key-value storage over a multi-region DynamoDB table.
//!
//! `chunkstore` stores values of any size in a table whose items are limited
//! in size. Values that fit in one block are written directly into the key's
//! head item; larger values are split into blocks under a fresh UUID and the
//! head item points at them with an `id=<uuid>;length=<n>` marker. Reads of the
//! head item race every configured region and take the first success, while
//! writes, deletes and block reads always go to the primary (first) region.
//!
//! Requests are signed with AWS Signature Version 4 and sent through an
//! `HttpTransport`. A `reqwest` transport is available with the default
//! `reqwest-transport` feature, and `MemoryTransport` emulates the store for
//! tests.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use chunkstore::{ChunkStore, Credentials, StoreConfig, Value};
//! use chunkstore::wire::MemoryTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::builder(Credentials::new("AKID", "secret"))
//!     .with_table_name("Values")
//!     .add_region("us-west-2")
//!     .add_region("us-east-1")
//!     .build()?;
//!
//! let transport = Arc::new(MemoryTransport::for_config(&config));
//! let store = ChunkStore::new(config, transport)?;
//!
//! // Replacing a blocked value hands back the old marker
//! if let Some(old) = store.put("greeting", "hello").await? {
//!     store.clean_blocks(&old).await?;
//! }
//!
//! assert_eq!(store.get("greeting").await?, Some(Value::Text("hello".into())));
//! assert!(store.del("greeting").await?);
//!
//! // Let background drains of racing reads finish
//! store.wait_idle().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod item;
pub mod metrics;
pub mod racing;
pub mod signer;
pub mod store;
pub mod wire;

// Re-export key types
pub use crate::config::{Credentials, StoreConfig, StoreConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::item::{BlockMetadata, HeadItem, ItemKey, Value, ValueKind};
pub use crate::metrics::{disable_metrics, metrics_enabled, set_metrics_provider, MetricsProvider};
pub use crate::racing::{AfterResponse, BackgroundTasks, RaceWin, RacingReader};
pub use crate::store::ChunkStore;
pub use crate::wire::{HttpRequest, HttpResponse, Outcome, WireClient};

use async_trait::async_trait;
use std::fmt;

/// HTTP transport interface supplied by the host
///
/// Implementations send one POST and return whatever status the server
/// answered with; only failures to get a response at all are errors.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Sends a request and returns the response
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse>;
}
