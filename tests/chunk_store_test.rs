use base64::{engine::general_purpose, Engine as _};
use chunkstore::wire::{MemoryTransport, Operation};
use chunkstore::{BlockMetadata, ChunkStore, Credentials, Error, StoreConfig, Value};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

const TABLE: &str = "Values";
const PRIMARY: &str = "us-west-2";
const REPLICA: &str = "us-east-1";

fn config(block_size: usize) -> StoreConfig {
    StoreConfig::builder(Credentials::new("AKIDEXAMPLE", "secret"))
        .with_table_name(TABLE)
        .with_regions([PRIMARY, REPLICA])
        .with_block_size(block_size)
        .build()
        .expect("valid config")
}

fn setup(block_size: usize) -> (ChunkStore, MemoryTransport) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = config(block_size);
    let transport = MemoryTransport::for_config(&config);
    let store = ChunkStore::new(config, Arc::new(transport.clone())).expect("store");
    (store, transport)
}

fn head_marker(transport: &MemoryTransport, key: &str) -> BlockMetadata {
    let head = transport.item(TABLE, key, 0).expect("head item");
    head["content"]["S"]
        .as_str()
        .expect("marker string")
        .parse()
        .expect("valid marker")
}

fn block_bytes(transport: &MemoryTransport, metadata: &BlockMetadata, index: u64) -> Vec<u8> {
    let block = transport
        .item(TABLE, &metadata.id.to_string(), index)
        .expect("block item");
    general_purpose::STANDARD
        .decode(block["content"]["B"].as_str().expect("binary block"))
        .expect("base64")
}

fn text(s: &str) -> Option<Value> {
    Some(Value::Text(s.to_string()))
}

#[tokio::test]
async fn test_direct_value_round_trip() {
    let (store, transport) = setup(64);

    assert_eq!(store.put("k", "hello world").await.unwrap(), None);
    assert_eq!(store.get("k").await.unwrap(), text("hello world"));

    // stored inline, untagged
    let head = transport.item(TABLE, "k", 0).unwrap();
    assert_eq!(head["content"], json!({"S": "hello world"}));
    assert!(head.get("chunkstore_blocks").is_none());
    assert_eq!(transport.item_count(TABLE), 1);

    store.wait_idle().await;
}

#[tokio::test]
async fn test_value_at_threshold_is_direct() {
    let (store, transport) = setup(8);
    store.put("k", "12345678").await.unwrap();

    assert_eq!(transport.item_count(TABLE), 1);
    assert_eq!(store.get("k").await.unwrap(), text("12345678"));
}

#[tokio::test]
async fn test_missing_key_reads_none() {
    let (store, _transport) = setup(64);
    assert_eq!(store.get("nope").await.unwrap(), None);
}

#[tokio::test]
async fn test_blocked_value_splits_multibyte_characters() {
    let (store, transport) = setup(16);
    let value = format!("{}€€€{}", "a".repeat(15), "b".repeat(10));
    assert_eq!(value.len(), 34);

    store.put("k", value.as_str()).await.unwrap();

    let metadata = head_marker(&transport, "k");
    assert_eq!(metadata.length, 3);

    // the first block ends inside the first euro sign
    let first = block_bytes(&transport, &metadata, 0);
    assert_eq!(first.len(), 16);
    assert!(std::str::from_utf8(&first).is_err());

    let head = transport.item(TABLE, "k", 0).unwrap();
    assert_eq!(head["chunkstore_blocks"], json!({"S": "text"}));

    assert_eq!(store.get("k").await.unwrap(), text(&value));
}

#[tokio::test]
async fn test_three_thresholds_plus_one_makes_four_blocks() {
    let (store, transport) = setup(8);
    let value = "x".repeat(3 * 8 + 1);

    store.put("k", value.as_str()).await.unwrap();

    let metadata = head_marker(&transport, "k");
    assert_eq!(metadata.length, 4);
    assert_eq!(transport.partition_count(TABLE, &metadata.id.to_string()), 4);
    for index in 0..3 {
        assert_eq!(block_bytes(&transport, &metadata, index).len(), 8);
    }
    assert_eq!(block_bytes(&transport, &metadata, 3), b"x".to_vec());

    assert_eq!(store.get("k").await.unwrap(), text(&value));
}

#[tokio::test]
async fn test_binary_value_round_trip() {
    let (store, transport) = setup(4);
    let bytes: Vec<u8> = (0..=255).collect();

    store.put("bin", bytes.clone()).await.unwrap();

    let head = transport.item(TABLE, "bin", 0).unwrap();
    assert_eq!(head["chunkstore_blocks"], json!({"S": "binary"}));
    assert_eq!(store.get("bin").await.unwrap(), Some(Value::Binary(bytes)));

    store.put("small", vec![1_u8, 2]).await.unwrap();
    assert_eq!(store.get("small").await.unwrap(), Some(Value::Binary(vec![1, 2])));
}

#[tokio::test]
async fn test_overwrite_returns_previous_marker_only_when_blocked() {
    let (store, transport) = setup(8);

    // direct -> direct
    store.put("k", "one").await.unwrap();
    assert_eq!(store.put("k", "two").await.unwrap(), None);
    assert_eq!(store.get("k").await.unwrap(), text("two"));

    // direct -> blocked
    assert_eq!(store.put("k", "a long value here").await.unwrap(), None);
    let first = head_marker(&transport, "k");

    // blocked -> blocked
    let previous = store.put("k", "another long value").await.unwrap();
    assert_eq!(previous, Some(first.clone()));
    let second = head_marker(&transport, "k");
    assert_ne!(first.id, second.id);
    assert_eq!(store.get("k").await.unwrap(), text("another long value"));

    // old blocks are left in place until cleaned
    assert_eq!(transport.partition_count(TABLE, &first.id.to_string()), 3);

    // blocked -> direct
    assert_eq!(store.put("k", "short").await.unwrap(), Some(second));
    assert_eq!(store.get("k").await.unwrap(), text("short"));
}

#[tokio::test]
async fn test_clean_removes_orphaned_blocks() {
    let (store, transport) = setup(8);

    store.put("k", "first value, long enough").await.unwrap();
    let old = store
        .put("k", "second value, also long")
        .await
        .unwrap()
        .expect("previous marker");
    let current = head_marker(&transport, "k");

    store.clean(&old.to_string()).await.unwrap();

    assert_eq!(transport.partition_count(TABLE, &old.id.to_string()), 0);
    for index in 0..old.length {
        assert!(transport.item(TABLE, &old.id.to_string(), index).is_none());
    }

    // the live value and its blocks are untouched
    assert_eq!(
        transport.partition_count(TABLE, &current.id.to_string()),
        current.length as usize
    );
    assert_eq!(store.get("k").await.unwrap(), text("second value, also long"));
}

#[tokio::test]
async fn test_clean_rejects_malformed_marker() {
    let (store, transport) = setup(8);
    let err = store.clean("id=nope;length=2").await.unwrap_err();

    assert!(matches!(err, Error::InvalidMarker(_)));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_del_blocked_removes_blocks_then_head() {
    let (store, transport) = setup(8);
    store.put("k", "a value spanning blocks").await.unwrap();
    let metadata = head_marker(&transport, "k");
    transport.clear_requests();

    assert!(store.del("k").await.unwrap());
    assert_eq!(transport.item_count(TABLE), 0);
    assert_eq!(store.get("k").await.unwrap(), None);

    let deletes: Vec<_> = transport
        .requests()
        .into_iter()
        .filter(|r| r.operation == Operation::DeleteItem)
        .filter_map(|r| r.item_key("Key", "Index"))
        .collect();
    assert_eq!(deletes.len() as u64, metadata.length + 1);
    assert_eq!(deletes.last(), Some(&("k".to_string(), 0)));
    assert!(deletes[..deletes.len() - 1]
        .iter()
        .all(|(partition, _)| *partition == metadata.id.to_string()));
}

#[tokio::test]
async fn test_del_direct_value() {
    let (store, transport) = setup(64);
    store.put("k", "v").await.unwrap();

    assert!(store.del("k").await.unwrap());
    assert_eq!(transport.item_count(TABLE), 0);
}

#[tokio::test]
async fn test_del_absent_key_writes_nothing() {
    let (store, transport) = setup(64);

    assert!(!store.del("missing").await.unwrap());
    assert!(transport
        .requests()
        .iter()
        .all(|r| r.operation == Operation::GetItem));
}

#[tokio::test]
async fn test_get_survives_failed_primary() {
    let (store, transport) = setup(8);
    store.put("k", "value that needs blocks").await.unwrap();
    store.put("small", "v").await.unwrap();

    transport.set_region_down(PRIMARY, true);
    assert_eq!(store.get("small").await.unwrap(), text("v"));

    // block reads go to the primary only
    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, Error::BlockCorruption { .. }));

    transport.heal();
    transport.set_region_status(PRIMARY, Some(503));
    assert_eq!(store.get("small").await.unwrap(), text("v"));
}

#[tokio::test]
async fn test_get_with_every_region_down() {
    let (store, transport) = setup(64);
    store.put("k", "v").await.unwrap();

    transport.set_region_down(PRIMARY, true);
    transport.set_region_status(REPLICA, Some(500));

    match store.get("k").await {
        Err(Error::TotalUnavailability { key, failures }) => {
            assert_eq!(key, "k");
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected TotalUnavailability, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_block_is_corruption() {
    let (store, transport) = setup(8);
    store.put("k", "x".repeat(20).as_str()).await.unwrap();
    let metadata = head_marker(&transport, "k");
    assert_eq!(metadata.length, 3);

    assert!(transport.remove_item(TABLE, &metadata.id.to_string(), 1));

    match store.get("k").await {
        Err(Error::BlockCorruption {
            key,
            metadata: marker,
            index,
            ..
        }) => {
            assert_eq!(key, "k");
            assert_eq!(marker, metadata.to_string());
            assert_eq!(index, 1);
        }
        other => panic!("expected BlockCorruption, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_utf8_block_is_corruption() {
    let (store, transport) = setup(8);
    store.put("k", "y".repeat(20).as_str()).await.unwrap();
    let metadata = head_marker(&transport, "k");

    let mut block = Map::new();
    block.insert("Key".into(), json!({"S": metadata.id.to_string()}));
    block.insert("Index".into(), json!({"N": "2"}));
    block.insert("content".into(), json!({"B": general_purpose::STANDARD.encode([0xff_u8])}));
    transport.insert_item(TABLE, &metadata.id.to_string(), 2, block);

    let err = store.get("k").await.unwrap_err();
    assert!(err.is_corruption());
    assert!(matches!(err, Error::BlockCorruption { index: 2, .. }));
}

#[tokio::test]
async fn test_failed_block_write_leaves_head_untouched() {
    let (store, transport) = setup(8);
    store.put("k", "before").await.unwrap();

    transport.fail_when(|r| {
        r.operation == Operation::PutItem
            && matches!(r.item_key("Key", "Index"), Some((p, 2)) if p != "k")
    });

    match store.put("k", "z".repeat(30).as_str()).await {
        Err(Error::PartialWriteFailure {
            key,
            block_id,
            index,
            ..
        }) => {
            assert_eq!(key, "k");
            assert_eq!(index, 2);
            // the other blocks were written and are now orphans
            assert_eq!(transport.partition_count(TABLE, &block_id), 3);
        }
        other => panic!("expected PartialWriteFailure, got {:?}", other),
    }

    assert_eq!(store.get("k").await.unwrap(), text("before"));
}

#[tokio::test]
async fn test_marker_lookalike_is_stored_as_text() {
    let (store, transport) = setup(64);
    let lookalike = "id=0f8fad5b-d9cb-469f-a165-70867728950e;length=3";

    store.put("k", lookalike).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), text(lookalike));

    // not a previous marker either
    assert_eq!(store.put("k", "other").await.unwrap(), None);
    assert_eq!(transport.item_count(TABLE), 1);
}

fn legacy_setup() -> (ChunkStore, MemoryTransport) {
    let config = StoreConfig::builder(Credentials::new("AKIDEXAMPLE", "secret"))
        .with_table_name(TABLE)
        .with_regions([PRIMARY])
        .with_legacy_marker_detection(true)
        .build()
        .unwrap();
    let transport = MemoryTransport::for_config(&config);
    let store = ChunkStore::new(config, Arc::new(transport.clone())).unwrap();
    (store, transport)
}

fn insert_raw(transport: &MemoryTransport, partition: &str, index: u64, value: JsonValue) {
    let mut item = Map::new();
    item.insert("Key".into(), json!({"S": partition}));
    item.insert("Index".into(), json!({"N": index.to_string()}));
    item.insert("content".into(), value);
    transport.insert_item(TABLE, partition, index, item);
}

#[tokio::test]
async fn test_legacy_untagged_marker_with_text_blocks() {
    let (store, transport) = legacy_setup();

    let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
    insert_raw(&transport, "legacy", 0, json!({"S": format!("id={};length=2", id)}));
    insert_raw(&transport, id, 0, json!({"S": "hello "}));
    insert_raw(&transport, id, 1, json!({"S": "world"}));

    assert_eq!(store.get("legacy").await.unwrap(), text("hello world"));

    // a binary block switches reassembly to bytes
    insert_raw(&transport, id, 1, json!({"B": general_purpose::STANDARD.encode("wörld")}));
    assert_eq!(store.get("legacy").await.unwrap(), text("hello wörld"));

    assert!(store.del("legacy").await.unwrap());
    assert_eq!(transport.item_count(TABLE), 0);
}

#[tokio::test]
async fn test_legacy_marker_with_uppercase_id() {
    let (store, transport) = legacy_setup();

    let id = "0F8FAD5B-D9CB-469F-A165-70867728950E";
    let marker = format!("id={};length=1", id);
    insert_raw(&transport, "legacy", 0, json!({"S": marker}));
    insert_raw(&transport, id, 0, json!({"S": "hello"}));

    assert_eq!(store.get("legacy").await.unwrap(), text("hello"));

    // blocks are found under the id exactly as written
    transport.remove_item(TABLE, "legacy", 0);
    store.clean(&marker).await.unwrap();
    assert_eq!(transport.item_count(TABLE), 0);

    // a missing block reports the marker as stored
    insert_raw(&transport, "legacy", 0, json!({"S": marker}));
    match store.get("legacy").await {
        Err(Error::BlockCorruption { metadata, index, .. }) => {
            assert_eq!(metadata, marker);
            assert_eq!(index, 0);
        }
        other => panic!("expected BlockCorruption, got {:?}", other),
    }
}

#[tokio::test]
async fn test_straggler_drain_outlives_the_store() {
    let (store, transport) = setup(64);
    store.put("k", "v").await.unwrap();
    transport.set_latency(REPLICA, Duration::from_millis(50));

    let replica_reads = || {
        transport
            .requests()
            .iter()
            .filter(|r| r.region == REPLICA)
            .count()
    };

    assert_eq!(store.get("k").await.unwrap(), text("v"));
    assert_eq!(replica_reads(), 0);

    drop(store);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(replica_reads(), 1);
}

#[tokio::test]
async fn test_list_tables_passthrough() {
    let (store, _transport) = setup(64);
    store.put("k", "v").await.unwrap();

    let tables = store.list_tables(REPLICA).await.unwrap();
    assert_eq!(tables, json!({"TableNames": [TABLE]}));
}

#[tokio::test]
async fn test_writes_go_to_primary_only() {
    let (store, transport) = setup(8);
    store.put("k", "some value over eight").await.unwrap();
    store.del("k").await.unwrap();

    assert!(transport
        .requests()
        .iter()
        .filter(|r| r.operation != Operation::GetItem)
        .all(|r| r.region == PRIMARY));
}
