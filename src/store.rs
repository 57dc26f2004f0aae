//! The chunked key-value store
//!
//! Values whose encoded form fits in one block live directly in the head item
//! `(key, 0)`. Larger values are split into blocks stored under a fresh UUID
//! and the head item holds a tagged `id=<uuid>;length=<n>` marker instead.
//!
//! Blocks are never deleted implicitly. `put` returns the marker it replaced
//! and `clean` reclaims the blocks behind it once the caller is done with them.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::item::{BlockMetadata, HeadItem, ItemKey, Value, ValueKind};
use crate::racing::{AfterResponse, BackgroundTasks, RacingReader};
use crate::wire::{Failure, WireClient};
use crate::{timer, HttpTransport};
use futures::future::join_all;
use metrics::counter;
use std::sync::Arc;

/// Chunked key-value store over a multi-region table
#[derive(Debug)]
pub struct ChunkStore {
    config: Arc<StoreConfig>,
    client: Arc<WireClient>,
    reader: RacingReader,
    tasks: Arc<BackgroundTasks>,
}

impl ChunkStore {
    /// Creates a store, validating the configuration
    pub fn new(config: StoreConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_client(WireClient::new(Arc::new(config), transport)))
    }

    /// Creates a store sending requests through `reqwest`
    #[cfg(feature = "reqwest-transport")]
    pub fn with_default_transport(config: StoreConfig) -> Result<Self> {
        Self::new(config, Arc::new(crate::wire::ReqwestTransport::new()))
    }

    /// Creates a store around a prepared client
    pub fn from_client(client: WireClient) -> Self {
        let client = Arc::new(client);
        let tasks = Arc::new(BackgroundTasks::new());
        Self {
            config: Arc::clone(client.shared_config()),
            reader: RacingReader::new(client.clone(), tasks.clone()),
            client,
            tasks,
        }
    }

    /// Hands background drains to the host's after-response hook
    pub fn with_after_response(mut self, hook: Arc<dyn AfterResponse>) -> Self {
        self.reader = self.reader.with_after_response(hook);
        self
    }

    /// The configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Registry of background drains spawned by racing reads
    pub fn background_tasks(&self) -> &Arc<BackgroundTasks> {
        &self.tasks
    }

    /// Waits for outstanding background drains, typically at shutdown
    pub async fn wait_idle(&self) {
        self.tasks.wait_idle().await;
    }

    fn primary(&self) -> &str {
        self.config.primary_region()
    }

    /// Reads a value.
    ///
    /// Returns `None` when the key is absent, `Error::TotalUnavailability` when
    /// no region could be read, and `Error::BlockCorruption` when the key's
    /// blocks are incomplete.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _timer = timer!("chunkstore.store.get");

        let win = self.reader.race_read(key, &ItemKey::head(key)).await?;
        let Some(item) = win.item else {
            return Ok(None);
        };

        match HeadItem::decode(&self.config, item)? {
            HeadItem::Direct(value) => Ok(Some(value)),
            HeadItem::BlockRef { metadata, kind } => {
                self.read_blocks(key, &metadata, kind).await.map(Some)
            }
        }
    }

    async fn read_blocks(
        &self,
        key: &str,
        metadata: &BlockMetadata,
        kind: Option<ValueKind>,
    ) -> Result<Value> {
        let primary = self.primary();
        let results = join_all(
            metadata
                .block_keys()
                .map(|block| async move { self.client.get_item(primary, &block).await }),
        )
        .await;

        let corruption = |index: u64, reason: String| {
            log::warn!("{} references unreadable block {} of {}: {}", key, index, metadata, reason);
            Error::BlockCorruption {
                key: key.to_string(),
                metadata: metadata.to_string(),
                index,
                reason,
            }
        };

        let mut blocks = Vec::with_capacity(results.len());
        for (index, result) in (0_u64..).zip(results) {
            match result {
                Ok(Some(item)) => blocks.push(item.value),
                Ok(None) => return Err(corruption(index, "block is absent".into())),
                Err(failure) => return Err(corruption(index, failure.to_string())),
            }
        }
        counter!("chunkstore.blocks.read", metadata.length);

        let decode_bytes = match kind {
            Some(ValueKind::Binary) => return Ok(Value::Binary(concat_bytes(blocks))),
            Some(ValueKind::Text) => true,
            None => blocks.iter().any(|b| matches!(b, Value::Binary(_))),
        };

        if !decode_bytes {
            let joined = blocks
                .into_iter()
                .filter_map(|b| match b {
                    Value::Text(s) => Some(s),
                    Value::Binary(_) => None,
                })
                .collect::<String>();
            return Ok(Value::Text(joined));
        }

        let lengths: Vec<usize> = blocks.iter().map(Value::len).collect();
        String::from_utf8(concat_bytes(blocks))
            .map(Value::Text)
            .map_err(|e| {
                let offset = e.utf8_error().valid_up_to();
                let index = block_index_at(&lengths, offset);
                corruption(index, format!("invalid UTF-8 at byte {}", offset))
            })
    }

    /// Stores a value, returning the marker of the blocks it replaced.
    ///
    /// Replaced blocks are not deleted; pass the returned marker to `clean`
    /// once no reader can still be following it.
    pub async fn put(&self, key: &str, value: impl Into<Value>) -> Result<Option<BlockMetadata>> {
        let _timer = timer!("chunkstore.store.put");
        let value = value.into();
        let head = ItemKey::head(key);
        let primary = self.primary();

        let previous = match self.client.get_item(primary, &head).await? {
            Some(item) => match HeadItem::decode(&self.config, item) {
                Ok(head) => head.metadata().cloned(),
                Err(e) => {
                    log::warn!("overwriting undecodable head item of {}: {}", key, e);
                    None
                }
            },
            None => None,
        };

        if value.len() <= self.config.block_size {
            self.client.put_item(primary, &head, &value, None).await?;
            return Ok(previous);
        }

        let kind = value.kind();
        let chunks: Vec<&[u8]> = value.as_bytes().chunks(self.config.block_size).collect();
        let metadata = BlockMetadata::generate(chunks.len() as u64);
        log::debug!("writing {} bytes of {} as {}", value.len(), key, metadata);

        let results = join_all(
            (0_u64..)
                .zip(chunks)
                .map(|(index, chunk)| self.write_block(primary, &metadata, index, chunk)),
        )
        .await;

        if let Some((index, failure)) = (0_u64..).zip(results).find_map(|(i, r)| r.err().map(|f| (i, f))) {
            log::warn!("aborting put of {}: block {} of {} failed: {}", key, index, metadata, failure);
            return Err(Error::PartialWriteFailure {
                key: key.to_string(),
                block_id: metadata.id.clone(),
                index,
                reason: failure.to_string(),
            });
        }
        counter!("chunkstore.blocks.written", metadata.length);

        let marker = Value::Text(metadata.to_string());
        if let Err(failure) = self.client.put_item(primary, &head, &marker, Some(kind)).await {
            log::warn!("head write of {} failed, {} is orphaned", key, metadata);
            return Err(failure.into());
        }

        Ok(previous)
    }

    async fn write_block(
        &self,
        region: &str,
        metadata: &BlockMetadata,
        index: u64,
        chunk: &[u8],
    ) -> std::result::Result<(), Failure> {
        let value = Value::Binary(chunk.to_vec());
        self.client
            .put_item(region, &metadata.block_key(index), &value, None)
            .await
    }

    /// Deletes a key and, when it is blocked, all of its blocks.
    ///
    /// Returns false without writing anything when the key is absent.
    pub async fn del(&self, key: &str) -> Result<bool> {
        let _timer = timer!("chunkstore.store.del");
        let head = ItemKey::head(key);
        let primary = self.primary();

        let Some(item) = self.client.get_item(primary, &head).await? else {
            return Ok(false);
        };

        match HeadItem::decode(&self.config, item) {
            Ok(HeadItem::BlockRef { metadata, .. }) => self.delete_blocks(&metadata).await?,
            Ok(HeadItem::Direct(_)) => {}
            Err(e) => log::warn!("deleting undecodable head item of {}: {}", key, e),
        }

        self.client.delete_item(primary, &head).await?;
        Ok(true)
    }

    /// Deletes the blocks referenced by a marker previously returned by `put`.
    ///
    /// Head items are not touched.
    pub async fn clean(&self, marker: &str) -> Result<()> {
        let metadata: BlockMetadata = marker.parse()?;
        self.clean_blocks(&metadata).await
    }

    /// Deletes the blocks described by `metadata`
    pub async fn clean_blocks(&self, metadata: &BlockMetadata) -> Result<()> {
        let _timer = timer!("chunkstore.store.clean");
        self.delete_blocks(metadata).await
    }

    async fn delete_blocks(&self, metadata: &BlockMetadata) -> Result<()> {
        let primary = self.primary();
        let results = join_all(
            metadata
                .block_keys()
                .map(|block| async move { self.client.delete_item(primary, &block).await }),
        )
        .await;

        results.into_iter().collect::<std::result::Result<Vec<_>, Failure>>()?;
        log::debug!("deleted {}", metadata);
        Ok(())
    }

    /// Lists the tables of a region; diagnostic only
    pub async fn list_tables(&self, region: &str) -> Result<serde_json::Value> {
        let body = self.client.list_tables(region).await.into_result()?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn concat_bytes(blocks: Vec<Value>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(blocks.iter().map(Value::len).sum());
    for block in blocks {
        bytes.extend_from_slice(block.as_bytes());
    }
    bytes
}

/// Index of the block containing byte `offset` of the concatenation
fn block_index_at(lengths: &[usize], offset: usize) -> u64 {
    let mut end = 0;
    for (index, len) in (0_u64..).zip(lengths) {
        end += len;
        if offset < end {
            return index;
        }
    }
    lengths.len().saturating_sub(1) as u64
}
