//! In-memory item store speaking the JSON 1.0 protocol
//!
//! Every region shares the same tables, the way a global table looks once
//! replication has caught up. Regions can be taken down, slowed down or made
//! to reject specific requests, which is what the racing and partial-failure
//! tests need. Not intended for production use.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::signer::ALGORITHM;
use crate::wire::{HttpRequest, HttpResponse, Operation, SERVICE, TARGET_PREFIX};
use crate::HttpTransport;
use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Table = BTreeMap<(String, u64), Map<String, JsonValue>>;

/// A request as seen by the memory store
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// Region parsed from the endpoint host
    pub region: String,
    /// Operation parsed from the target header
    pub operation: Operation,
    /// Parsed JSON body
    pub body: JsonValue,
}

impl RecordedRequest {
    /// Partition and sort key of an item request, if any
    pub fn item_key(&self, partition_key: &str, sort_key: &str) -> Option<(String, u64)> {
        let key = self.body.get("Key").or_else(|| self.body.get("Item"))?;
        let partition = key.get(partition_key)?.get("S")?.as_str()?.to_string();
        let sort = key
            .get(sort_key)
            .and_then(|n| n.get("N"))
            .and_then(JsonValue::as_str)
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        Some((partition, sort))
    }
}

type FailurePredicate = Arc<dyn Fn(&RecordedRequest) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    down: HashSet<String>,
    status: HashMap<String, u16>,
    latency: HashMap<String, Duration>,
    predicates: Vec<FailurePredicate>,
    log: Vec<RecordedRequest>,
}

/// In-memory `HttpTransport`
#[derive(Clone)]
pub struct MemoryTransport {
    partition_key: String,
    sort_key: String,
    domain: String,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("partition_key", &self.partition_key)
            .field("sort_key", &self.sort_key)
            .finish()
    }
}

impl MemoryTransport {
    /// Creates an empty store using the key attributes of `config`
    pub fn for_config(config: &StoreConfig) -> Self {
        Self {
            partition_key: config.partition_key.clone(),
            sort_key: config.sort_key.clone(),
            domain: config.domain.clone(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every request to `region` fail with a transport error
    pub fn set_region_down(&self, region: &str, down: bool) {
        let mut state = self.state();
        if down {
            state.down.insert(region.to_string());
        } else {
            state.down.remove(region);
        }
    }

    /// Makes every request to `region` answer with `status`
    pub fn set_region_status(&self, region: &str, status: Option<u16>) {
        let mut state = self.state();
        match status {
            Some(status) => state.status.insert(region.to_string(), status),
            None => state.status.remove(region),
        };
    }

    /// Delays every response from `region`
    pub fn set_latency(&self, region: &str, latency: Duration) {
        self.state().latency.insert(region.to_string(), latency);
    }

    /// Answers 500 to any request for which `predicate` returns true
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&RecordedRequest) -> bool + Send + Sync + 'static,
    {
        self.state().predicates.push(Arc::new(predicate));
    }

    /// Removes all failure switches, statuses, latencies and predicates
    pub fn heal(&self) {
        let mut state = self.state();
        state.down.clear();
        state.status.clear();
        state.latency.clear();
        state.predicates.clear();
    }

    /// Every request received so far, including failed ones
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().log.clone()
    }

    /// Forgets the request log
    pub fn clear_requests(&self) {
        self.state().log.clear();
    }

    /// Raw stored item
    pub fn item(&self, table: &str, partition: &str, sort: u64) -> Option<JsonValue> {
        self.state()
            .tables
            .get(table)
            .and_then(|t| t.get(&(partition.to_string(), sort)))
            .map(|item| JsonValue::Object(item.clone()))
    }

    /// Stores a raw item, bypassing the protocol
    pub fn insert_item(&self, table: &str, partition: &str, sort: u64, item: Map<String, JsonValue>) {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert((partition.to_string(), sort), item);
    }

    /// Removes a raw item, bypassing the protocol
    pub fn remove_item(&self, table: &str, partition: &str, sort: u64) -> bool {
        self.state()
            .tables
            .get_mut(table)
            .map(|t| t.remove(&(partition.to_string(), sort)).is_some())
            .unwrap_or(false)
    }

    /// Number of items in a table
    pub fn item_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Number of items in a table with the given partition key
    pub fn partition_count(&self, table: &str, partition: &str) -> usize {
        self.state()
            .tables
            .get(table)
            .map(|t| t.keys().filter(|(p, _)| p == partition).count())
            .unwrap_or(0)
    }

    fn region_of(&self, url: &str) -> Result<String> {
        let host = url
            .strip_prefix("https://")
            .and_then(|rest| rest.strip_suffix('/'))
            .ok_or_else(|| Error::Transport(format!("unexpected url {}", url)))?;

        host.strip_prefix(SERVICE)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.strip_suffix(self.domain.as_str()))
            .and_then(|rest| rest.strip_suffix('.'))
            .map(str::to_string)
            .ok_or_else(|| Error::Transport(format!("unknown host {}", host)))
    }

    fn key_of(&self, map: &Map<String, JsonValue>) -> Option<(String, u64)> {
        let partition = map.get(&self.partition_key)?.get("S")?.as_str()?.to_string();
        let sort = map.get(&self.sort_key)?.get("N")?.as_str()?.parse().ok()?;
        Some((partition, sort))
    }

    fn execute(&self, state: &mut State, request: &RecordedRequest) -> HttpResponse {
        let table_name = request.body.get("TableName").and_then(JsonValue::as_str);

        match (request.operation, table_name) {
            (Operation::ListTables, _) => {
                let mut names: Vec<_> = state.tables.keys().cloned().collect();
                names.sort();
                ok(json!({ "TableNames": names }))
            }
            (_, None) => client_error("ValidationException", "TableName is required"),
            (Operation::GetItem, Some(table)) => {
                let Some(key) = request.body.get("Key").and_then(JsonValue::as_object).and_then(|k| self.key_of(k)) else {
                    return client_error("ValidationException", "invalid key");
                };
                match state.tables.get(table).and_then(|t| t.get(&key)) {
                    Some(item) => ok(json!({ "Item": item })),
                    None => ok(json!({})),
                }
            }
            (Operation::PutItem, Some(table)) => {
                let Some(item) = request.body.get("Item").and_then(JsonValue::as_object) else {
                    return client_error("ValidationException", "Item is required");
                };
                let Some(key) = self.key_of(item) else {
                    return client_error("ValidationException", "invalid key");
                };
                state
                    .tables
                    .entry(table.to_string())
                    .or_default()
                    .insert(key, item.clone());
                ok(json!({}))
            }
            (Operation::DeleteItem, Some(table)) => {
                let Some(key) = request.body.get("Key").and_then(JsonValue::as_object).and_then(|k| self.key_of(k)) else {
                    return client_error("ValidationException", "invalid key");
                };
                if let Some(t) = state.tables.get_mut(table) {
                    t.remove(&key);
                }
                ok(json!({}))
            }
        }
    }
}

fn ok(body: JsonValue) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: body.to_string().into_bytes(),
    }
}

fn error_response(status: u16, kind: &str, message: &str) -> HttpResponse {
    let body = json!({
        "__type": format!("com.amazonaws.dynamodb.v20120810#{}", kind),
        "message": message,
    });
    HttpResponse {
        status,
        body: body.to_string().into_bytes(),
    }
}

fn client_error(kind: &str, message: &str) -> HttpResponse {
    error_response(400, kind, message)
}

#[async_trait]
impl HttpTransport for MemoryTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse> {
        let region = self.region_of(&request.url)?;

        let latency = self.state().latency.get(&region).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let operation = request
            .header("X-Amz-Target")
            .and_then(|t| t.strip_prefix(TARGET_PREFIX))
            .and_then(|t| t.strip_prefix('.'))
            .and_then(Operation::from_name);
        let signed = request
            .header("Authorization")
            .map(|a| a.starts_with(ALGORITHM))
            .unwrap_or(false);
        let body: JsonValue = serde_json::from_slice(&request.body)?;

        let mut state = self.state();

        let Some(operation) = operation else {
            return Ok(client_error("UnknownOperationException", "unknown target"));
        };

        let recorded = RecordedRequest {
            region: region.clone(),
            operation,
            body,
        };
        state.log.push(recorded.clone());

        if state.down.contains(&region) {
            return Err(Error::Transport(format!("connection to {} refused", region)));
        }
        if let Some(status) = state.status.get(&region) {
            return Ok(error_response(*status, "ServiceUnavailable", "region unavailable"));
        }
        if !signed {
            return Ok(client_error("MissingAuthenticationTokenException", "request is not signed"));
        }
        if state.predicates.iter().any(|p| p(&recorded)) {
            return Ok(error_response(500, "InternalServerError", "injected failure"));
        }

        Ok(self.execute(&mut state, &recorded))
    }
}
