//! Store configuration
//!
//! A `StoreConfig` is built once, validated, and then shared read-only as an
//! `Arc<StoreConfig>` by every component. There is no way to mutate it after
//! construction; a different configuration means a different `ChunkStore`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;

/// Default table name
pub const DEFAULT_TABLE_NAME: &str = "ChunkStore";

/// Default partition key attribute name
pub const DEFAULT_PARTITION_KEY: &str = "Key";

/// Default sort key attribute name
pub const DEFAULT_SORT_KEY: &str = "Index";

/// Default value attribute name
pub const DEFAULT_VALUE_ATTRIBUTE: &str = "content";

/// Default attribute tagging head items that reference blocks
pub const DEFAULT_TAG_ATTRIBUTE: &str = "chunkstore_blocks";

/// Default domain appended to `dynamodb.<region>.`
pub const DEFAULT_DOMAIN: &str = "amazonaws.com";

/// Default block size threshold in bytes.
///
/// The store limits items to 400 KB including attribute names and the
/// key attributes, so values are kept comfortably below that.
pub const DEFAULT_BLOCK_SIZE: usize = 350_000;

/// Access credentials used to sign every request
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    /// Access key id
    pub access_key: String,

    /// Secret access key
    pub secret_key: String,
}

impl Credentials {
    /// Creates a new credentials pair
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Immutable configuration for a `ChunkStore`
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Signing credentials
    pub credentials: Credentials,

    /// Table holding head items and blocks
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Partition (hash) key attribute name, string typed
    #[serde(default = "default_partition_key")]
    pub partition_key: String,

    /// Sort (range) key attribute name, number typed
    #[serde(default = "default_sort_key")]
    pub sort_key: String,

    /// Attribute holding the value
    #[serde(default = "default_value_attribute")]
    pub value_attribute: String,

    /// Attribute marking head items that reference blocks
    #[serde(default = "default_tag_attribute")]
    pub tag_attribute: String,

    /// Ordered regions; the first is the primary
    pub regions: Vec<String>,

    /// Largest encoded value stored directly in a head item, and the size of each block
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Endpoint domain, `https://dynamodb.<region>.<domain>/`
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Treat untagged head values that look like markers as block references
    #[serde(default)]
    pub legacy_marker_detection: bool,
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

fn default_partition_key() -> String {
    DEFAULT_PARTITION_KEY.to_string()
}

fn default_sort_key() -> String {
    DEFAULT_SORT_KEY.to_string()
}

fn default_value_attribute() -> String {
    DEFAULT_VALUE_ATTRIBUTE.to_string()
}

fn default_tag_attribute() -> String {
    DEFAULT_TAG_ATTRIBUTE.to_string()
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

impl StoreConfig {
    /// Starts a builder with the given credentials
    pub fn builder(credentials: Credentials) -> StoreConfigBuilder {
        StoreConfigBuilder::new(credentials)
    }

    /// The primary region, used for writes, deletes and block reads
    pub fn primary_region(&self) -> &str {
        // validate() guarantees at least one region
        self.regions.first().map(String::as_str).unwrap_or_default()
    }

    /// Checks the configuration for missing or conflicting settings
    pub fn validate(&self) -> Result<()> {
        if self.credentials.access_key.is_empty() || self.credentials.secret_key.is_empty() {
            return Err(Error::Config("credentials must not be empty".into()));
        }

        if self.regions.is_empty() {
            return Err(Error::Config("at least one region is required".into()));
        }

        if let Some(region) = self.regions.iter().find(|r| r.is_empty()) {
            return Err(Error::Config(format!("invalid region name {:?}", region)));
        }

        if self.block_size == 0 {
            return Err(Error::Config("block size must be greater than zero".into()));
        }

        let attributes = [
            &self.partition_key,
            &self.sort_key,
            &self.value_attribute,
            &self.tag_attribute,
        ];
        if attributes.iter().any(|a| a.is_empty()) {
            return Err(Error::Config("attribute names must not be empty".into()));
        }
        for (i, a) in attributes.iter().enumerate() {
            if attributes[i + 1..].contains(a) {
                return Err(Error::Config(format!("attribute name {} is used twice", a)));
            }
        }

        if self.table_name.is_empty() {
            return Err(Error::Config("table name must not be empty".into()));
        }

        Ok(())
    }
}

/// Builder for `StoreConfig`
#[derive(Debug, Clone)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Creates a builder with default attribute names and no regions
    pub fn new(credentials: Credentials) -> Self {
        Self {
            config: StoreConfig {
                credentials,
                table_name: default_table_name(),
                partition_key: default_partition_key(),
                sort_key: default_sort_key(),
                value_attribute: default_value_attribute(),
                tag_attribute: default_tag_attribute(),
                regions: Vec::new(),
                block_size: DEFAULT_BLOCK_SIZE,
                domain: default_domain(),
                legacy_marker_detection: false,
            },
        }
    }

    /// Sets the table name
    pub fn with_table_name(mut self, table_name: &str) -> Self {
        self.config.table_name = table_name.to_string();
        self
    }

    /// Sets the partition key attribute name
    pub fn with_partition_key(mut self, name: &str) -> Self {
        self.config.partition_key = name.to_string();
        self
    }

    /// Sets the sort key attribute name
    pub fn with_sort_key(mut self, name: &str) -> Self {
        self.config.sort_key = name.to_string();
        self
    }

    /// Sets the value attribute name
    pub fn with_value_attribute(mut self, name: &str) -> Self {
        self.config.value_attribute = name.to_string();
        self
    }

    /// Sets the block reference tag attribute name
    pub fn with_tag_attribute(mut self, name: &str) -> Self {
        self.config.tag_attribute = name.to_string();
        self
    }

    /// Appends a region; the first one added is the primary
    pub fn add_region(mut self, region: &str) -> Self {
        self.config.regions.push(region.to_string());
        self
    }

    /// Replaces the region list
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the block size threshold in bytes
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Sets the endpoint domain (used for local emulators and other partitions)
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.config.domain = domain.to_string();
        self
    }

    /// Enables pattern-only detection of block references written without a tag
    pub fn with_legacy_marker_detection(mut self, enabled: bool) -> Self {
        self.config.legacy_marker_detection = enabled;
        self
    }

    /// Validates and returns the configuration
    pub fn build(self) -> Result<StoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
