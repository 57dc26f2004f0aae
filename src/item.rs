//! Items, values and block metadata
//!
//! Everything that crosses the wire as an item is converted here: item keys
//! to `Key` maps, values to `S`/`B` attribute values, and raw head items to
//! the `HeadItem` variant that the rest of the crate works with.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

/// Sort key of the head item of every logical key
pub const HEAD_SORT_KEY: u64 = 0;

/// A stored value, either UTF-8 text or raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// UTF-8 text, stored as an `S` attribute
    Text(String),
    /// Raw bytes, stored as a base64 `B` attribute
    Binary(Vec<u8>),
}

impl Value {
    /// The encoded bytes of the value
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Value::Text(s) => s.as_bytes(),
            Value::Binary(b) => b,
        }
    }

    /// Consumes the value, returning its encoded bytes
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Value::Text(s) => s.into_bytes(),
            Value::Binary(b) => b,
        }
    }

    /// Length of the encoded value in bytes
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the encoded value is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The kind of value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Binary(_) => ValueKind::Binary,
        }
    }

    /// Returns the text if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Binary(_) => None,
        }
    }

    fn to_attribute(&self) -> AttributeValue {
        match self {
            Value::Text(s) => AttributeValue::S(s.clone()),
            Value::Binary(b) => AttributeValue::B(general_purpose::STANDARD.encode(b)),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Binary(b.to_vec())
    }
}

/// Whether a blocked value was originally text or bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// UTF-8 text
    Text,
    /// Raw bytes
    Binary,
}

impl ValueKind {
    /// Tag attribute representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Text => "text",
            ValueKind::Binary => "binary",
        }
    }
}

impl FromStr for ValueKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(ValueKind::Text),
            "binary" => Ok(ValueKind::Binary),
            other => Err(Error::InvalidItem(format!("unknown block tag {:?}", other))),
        }
    }
}

/// The attribute value shapes this crate reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// String
    S(String),
    /// Number, as its decimal string
    N(String),
    /// Binary, base64 encoded
    B(String),
}

/// Primary key of one item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    /// Partition key value
    pub partition: String,
    /// Sort key value
    pub sort: u64,
}

impl ItemKey {
    /// Creates a key
    pub fn new(partition: impl Into<String>, sort: u64) -> Self {
        Self {
            partition: partition.into(),
            sort,
        }
    }

    /// The head item of a logical key
    pub fn head(key: &str) -> Self {
        Self::new(key, HEAD_SORT_KEY)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.partition, self.sort)
    }
}

/// Reference from a head item to the blocks holding its value
///
/// The id is kept exactly as written in the marker, so blocks stored under an
/// uppercase id are still found.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockMetadata {
    /// Partition key shared by all blocks
    pub id: String,
    /// Number of blocks, at least one
    pub length: u64,
}

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^id=([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12});length=([1-9][0-9]*)$",
        )
        .expect("marker pattern is valid")
    })
}

impl BlockMetadata {
    /// Creates metadata for `length` blocks under a fresh random id
    pub fn generate(length: u64) -> Self {
        Self {
            id: Uuid::new_v4().hyphenated().to_string(),
            length,
        }
    }

    /// Whether a string has the exact marker syntax
    pub fn matches(s: &str) -> bool {
        marker_pattern().is_match(s)
    }

    /// Key of block `index`
    pub fn block_key(&self, index: u64) -> ItemKey {
        ItemKey::new(self.id.as_str(), index)
    }

    /// Keys of every block, in index order
    pub fn block_keys(&self) -> impl Iterator<Item = ItemKey> + '_ {
        (0..self.length).map(move |i| self.block_key(i))
    }
}

impl fmt::Display for BlockMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id={};length={}", self.id, self.length)
    }
}

impl FromStr for BlockMetadata {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = marker_pattern()
            .captures(s)
            .ok_or_else(|| Error::InvalidMarker(s.to_string()))?;

        let id = caps[1].to_string();
        let length = caps[2]
            .parse::<u64>()
            .map_err(|e| Error::InvalidMarker(format!("{}: {}", s, e)))?;

        Ok(Self { id, length })
    }
}

/// An item as read from the store, reduced to the attributes this crate uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    /// The value attribute
    pub value: Value,
    /// The block tag attribute, if present
    pub tag: Option<String>,
}

/// A decoded head item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadItem {
    /// The value is stored inline
    Direct(Value),
    /// The value is spread over blocks
    BlockRef {
        /// Where the blocks live
        metadata: BlockMetadata,
        /// Original value kind; `None` for untagged legacy markers
        kind: Option<ValueKind>,
    },
}

impl HeadItem {
    /// Decodes a raw head item.
    ///
    /// Only tagged items are block references, unless legacy detection is on,
    /// in which case an untagged text value with marker syntax also is one.
    pub fn decode(config: &StoreConfig, item: StoredItem) -> Result<Self> {
        match (item.tag, item.value) {
            (Some(tag), Value::Text(marker)) => Ok(HeadItem::BlockRef {
                metadata: marker.parse()?,
                kind: Some(tag.parse()?),
            }),
            (Some(_), Value::Binary(_)) => Err(Error::InvalidItem(
                "tagged head item holds a binary value".into(),
            )),
            (None, Value::Text(s)) if config.legacy_marker_detection && BlockMetadata::matches(&s) => {
                Ok(HeadItem::BlockRef {
                    metadata: s.parse()?,
                    kind: None,
                })
            }
            (None, value) => Ok(HeadItem::Direct(value)),
        }
    }

    /// The block metadata, if this head references blocks
    pub fn metadata(&self) -> Option<&BlockMetadata> {
        match self {
            HeadItem::Direct(_) => None,
            HeadItem::BlockRef { metadata, .. } => Some(metadata),
        }
    }
}

fn attribute_json(value: AttributeValue) -> Result<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

/// Builds the `Key` map of a request
pub fn key_json(config: &StoreConfig, key: &ItemKey) -> Result<Map<String, JsonValue>> {
    let mut map = Map::new();
    map.insert(
        config.partition_key.clone(),
        attribute_json(AttributeValue::S(key.partition.clone()))?,
    );
    map.insert(
        config.sort_key.clone(),
        attribute_json(AttributeValue::N(key.sort.to_string()))?,
    );
    Ok(map)
}

/// Body of a GetItem request
pub fn get_item_body(config: &StoreConfig, key: &ItemKey) -> Result<String> {
    let body = json!({
        "TableName": config.table_name,
        "Key": key_json(config, key)?,
    });
    Ok(body.to_string())
}

/// Body of a DeleteItem request
pub fn delete_item_body(config: &StoreConfig, key: &ItemKey) -> Result<String> {
    get_item_body(config, key)
}

/// Body of a PutItem request; `tag` marks a head item that references blocks
pub fn put_item_body(
    config: &StoreConfig,
    key: &ItemKey,
    value: &Value,
    tag: Option<ValueKind>,
) -> Result<String> {
    let mut item = key_json(config, key)?;
    item.insert(config.value_attribute.clone(), attribute_json(value.to_attribute())?);
    if let Some(kind) = tag {
        item.insert(
            config.tag_attribute.clone(),
            attribute_json(AttributeValue::S(kind.as_str().to_string()))?,
        );
    }

    let body = json!({
        "TableName": config.table_name,
        "Item": item,
    });
    Ok(body.to_string())
}

#[derive(Deserialize)]
struct GetItemResponse {
    #[serde(rename = "Item")]
    item: Option<Map<String, JsonValue>>,
}

/// Parses a GetItem response body.
///
/// An absent `Item`, or an item without the value attribute, reads as `None`.
pub fn parse_get_item_response(config: &StoreConfig, body: &[u8]) -> Result<Option<StoredItem>> {
    let response: GetItemResponse = serde_json::from_slice(body)?;
    let Some(mut item) = response.item else {
        return Ok(None);
    };

    let Some(raw_value) = item.remove(&config.value_attribute) else {
        return Ok(None);
    };

    let value = match serde_json::from_value::<AttributeValue>(raw_value)? {
        AttributeValue::S(s) => Value::Text(s),
        AttributeValue::B(b) => Value::Binary(
            general_purpose::STANDARD
                .decode(b)
                .map_err(|e| Error::InvalidItem(format!("invalid base64 value: {}", e)))?,
        ),
        AttributeValue::N(_) => {
            return Err(Error::InvalidItem(format!(
                "attribute {} holds a number",
                config.value_attribute
            )))
        }
    };

    let tag = match item.remove(&config.tag_attribute) {
        Some(raw) => match serde_json::from_value::<AttributeValue>(raw)? {
            AttributeValue::S(s) => Some(s),
            _ => {
                return Err(Error::InvalidItem(format!(
                    "attribute {} is not a string",
                    config.tag_attribute
                )))
            }
        },
        None => None,
    };

    Ok(Some(StoredItem { value, tag }))
}
