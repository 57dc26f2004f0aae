//! Signed calls to one region of the item store
//!
//! `WireClient::call` is the single place where HTTP and transport failures
//! are observed. Both are folded into `Outcome::Failure`, so nothing above
//! this module has to deal with a transport error escaping.

pub mod memory;
#[cfg(feature = "reqwest-transport")]
mod reqwest_transport;

pub use memory::MemoryTransport;
#[cfg(feature = "reqwest-transport")]
pub use reqwest_transport::ReqwestTransport;

use crate::config::StoreConfig;
use crate::error::Error;
use crate::item::{self, ItemKey, StoredItem, Value, ValueKind};
use crate::signer::{self, SigningParams};
use crate::{timer, HttpTransport};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Service name used in the endpoint host and the credential scope
pub const SERVICE: &str = "dynamodb";

/// Prefix of the `X-Amz-Target` header
pub const TARGET_PREFIX: &str = "DynamoDB_20120810";

/// Content type of every request
pub const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

/// A store API operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read one item
    GetItem,
    /// Create or replace one item
    PutItem,
    /// Delete one item
    DeleteItem,
    /// List the account's tables
    ListTables,
}

impl Operation {
    /// Operation name as used in the target header
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GetItem => "GetItem",
            Operation::PutItem => "PutItem",
            Operation::DeleteItem => "DeleteItem",
            Operation::ListTables => "ListTables",
        }
    }

    /// `X-Amz-Target` header value
    pub fn target(&self) -> String {
        format!("{}.{}", TARGET_PREFIX, self.as_str())
    }

    /// Parses an operation name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "GetItem" => Some(Operation::GetItem),
            "PutItem" => Some(Operation::PutItem),
            "DeleteItem" => Some(Operation::DeleteItem),
            "ListTables" => Some(Operation::ListTables),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Full URL
    pub url: String,
    /// Header name/value pairs, in the order they were set
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Returns the first header with the given name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Why a call failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The region answered with a non-success status
    Http(u16),
    /// The request never got a response
    Transport,
    /// A success response could not be decoded
    InvalidResponse,
}

/// A failed call to one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Region the call was sent to
    pub region: String,
    /// Operation that failed
    pub operation: Operation,
    /// Category of failure
    pub kind: FailureKind,
    /// Response body or error text
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Http(status) => write!(f, "{}: HTTP {} {}", self.region, status, self.reason),
            FailureKind::Transport => write!(f, "{}: transport error {}", self.region, self.reason),
            FailureKind::InvalidResponse => write!(f, "{}: invalid response {}", self.region, self.reason),
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::RegionFailure {
            region: failure.region.clone(),
            operation: failure.operation.to_string(),
            reason: failure.to_string(),
        }
    }
}

/// Normalized result of one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx response
    Success {
        /// Status code
        status: u16,
        /// Response body
        body: Vec<u8>,
    },
    /// Non-2xx response or transport error
    Failure(Failure),
}

impl Outcome {
    /// Whether the call succeeded
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Converts into the body or the failure
    pub fn into_result(self) -> Result<Vec<u8>, Failure> {
        match self {
            Outcome::Success { body, .. } => Ok(body),
            Outcome::Failure(f) => Err(f),
        }
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Client for signed calls against any configured region
pub struct WireClient {
    config: Arc<StoreConfig>,
    transport: Arc<dyn HttpTransport>,
    clock: Clock,
}

impl fmt::Debug for WireClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireClient")
            .field("regions", &self.config.regions)
            .field("table_name", &self.config.table_name)
            .field("transport", &self.transport)
            .finish()
    }
}

impl WireClient {
    /// Creates a client using the system clock
    pub fn new(config: Arc<StoreConfig>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config,
            transport,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the clock used for request timestamps
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// The configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The shared configuration handle
    pub fn shared_config(&self) -> &Arc<StoreConfig> {
        &self.config
    }

    /// Endpoint host of a region
    pub fn host(&self, region: &str) -> String {
        format!("{}.{}.{}", SERVICE, region, self.config.domain)
    }

    /// Builds the signed request for one call
    pub fn build_request(&self, region: &str, operation: Operation, body: String) -> HttpRequest {
        let timestamp = (self.clock)();
        let host = self.host(region);

        let authorization = signer::sign(
            &SigningParams {
                access_key: &self.config.credentials.access_key,
                secret_key: &self.config.credentials.secret_key,
                region,
                service: SERVICE,
                method: "POST",
                uri: "/",
                query: "",
                host: &host,
                payload: body.as_bytes(),
            },
            &timestamp,
        );

        HttpRequest {
            url: format!("https://{}/", host),
            headers: vec![
                ("Accept-Encoding".to_string(), "identity".to_string()),
                ("Content-Type".to_string(), CONTENT_TYPE.to_string()),
                ("Authorization".to_string(), authorization),
                ("X-Amz-Date".to_string(), signer::amz_date(&timestamp)),
                ("X-Amz-Target".to_string(), operation.target()),
            ],
            body: body.into_bytes(),
        }
    }

    /// Sends one signed call and normalizes the result
    pub async fn call(&self, region: &str, operation: Operation, body: String) -> Outcome {
        let _timer = timer!("chunkstore.wire.call", "op" => operation);

        let request = self.build_request(region, operation, body);
        let failure = |kind, reason| {
            Outcome::Failure(Failure {
                region: region.to_string(),
                operation,
                kind,
                reason,
            })
        };

        match self.transport.post(request).await {
            Ok(response) if response.is_success() => {
                log::debug!("{} {} -> {}", region, operation, response.status);
                Outcome::Success {
                    status: response.status,
                    body: response.body,
                }
            }
            Ok(response) => {
                let reason = String::from_utf8_lossy(&response.body).into_owned();
                log::debug!("{} {} -> {} {}", region, operation, response.status, reason);
                failure(FailureKind::Http(response.status), reason)
            }
            Err(e) => {
                log::debug!("{} {} transport error: {}", region, operation, e);
                failure(FailureKind::Transport, e.to_string())
            }
        }
    }

    fn invalid_body(&self, region: &str, operation: Operation, err: Error) -> Failure {
        Failure {
            region: region.to_string(),
            operation,
            kind: FailureKind::InvalidResponse,
            reason: err.to_string(),
        }
    }

    /// Reads one item
    pub async fn get_item(&self, region: &str, key: &ItemKey) -> Result<Option<StoredItem>, Failure> {
        let operation = Operation::GetItem;
        let body = item::get_item_body(&self.config, key)
            .map_err(|e| self.invalid_body(region, operation, e))?;

        let response = self.call(region, operation, body).await.into_result()?;
        item::parse_get_item_response(&self.config, &response)
            .map_err(|e| self.invalid_body(region, operation, e))
    }

    /// Writes one item, replacing any previous item with the same key
    pub async fn put_item(
        &self,
        region: &str,
        key: &ItemKey,
        value: &Value,
        tag: Option<ValueKind>,
    ) -> Result<(), Failure> {
        let operation = Operation::PutItem;
        let body = item::put_item_body(&self.config, key, value, tag)
            .map_err(|e| self.invalid_body(region, operation, e))?;

        self.call(region, operation, body).await.into_result().map(drop)
    }

    /// Deletes one item; deleting an absent item succeeds
    pub async fn delete_item(&self, region: &str, key: &ItemKey) -> Result<(), Failure> {
        let operation = Operation::DeleteItem;
        let body = item::delete_item_body(&self.config, key)
            .map_err(|e| self.invalid_body(region, operation, e))?;

        self.call(region, operation, body).await.into_result().map(drop)
    }

    /// Lists the tables visible in a region
    pub async fn list_tables(&self, region: &str) -> Outcome {
        self.call(region, Operation::ListTables, "{}".to_string()).await
    }
}
