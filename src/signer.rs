//! AWS Signature Version 4 request signing
//!
//! Only the subset the item store's JSON protocol needs is implemented: two
//! signed headers (`host` and `x-amz-date`) and a hashed payload. The output
//! has to match the server's own derivation byte for byte.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Signing algorithm tag
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Signed header list, fixed for every request
pub const SIGNED_HEADERS: &str = "host;x-amz-date";

const SCOPE_TERMINATOR: &str = "aws4_request";

/// Everything that goes into one request signature
#[derive(Debug, Clone, Copy)]
pub struct SigningParams<'a> {
    /// Access key id
    pub access_key: &'a str,
    /// Secret access key
    pub secret_key: &'a str,
    /// Region name, part of the credential scope
    pub region: &'a str,
    /// Service name, part of the credential scope
    pub service: &'a str,
    /// HTTP method
    pub method: &'a str,
    /// Canonical URI
    pub uri: &'a str,
    /// Canonical query string
    pub query: &'a str,
    /// Host header value
    pub host: &'a str,
    /// Request body
    pub payload: &'a [u8],
}

/// Formats the full timestamp, `YYYYMMDDTHHMMSSZ`
pub fn amz_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Formats the date stamp, `YYYYMMDD`
pub fn date_stamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%d").to_string()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Derives the signing key for a day, region and service
pub fn signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, SCOPE_TERMINATOR.as_bytes())
}

/// Builds the canonical request string
pub fn canonical_request(params: &SigningParams<'_>, amz_date: &str) -> String {
    let canonical_headers = format!("host:{}\nx-amz-date:{}\n", params.host, amz_date);

    [
        params.method,
        params.uri,
        params.query,
        &canonical_headers,
        SIGNED_HEADERS,
        &sha256_hex(params.payload),
    ]
    .join("\n")
}

/// Builds the credential scope, `<datestamp>/<region>/<service>/aws4_request`
pub fn credential_scope(date_stamp: &str, region: &str, service: &str) -> String {
    format!("{}/{}/{}/{}", date_stamp, region, service, SCOPE_TERMINATOR)
}

/// Computes the `Authorization` header value for a request sent at `timestamp`
pub fn sign(params: &SigningParams<'_>, timestamp: &DateTime<Utc>) -> String {
    let amz_date = amz_date(timestamp);
    let date_stamp = date_stamp(timestamp);

    let scope = credential_scope(&date_stamp, params.region, params.service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request(params, &amz_date).as_bytes())
    );

    let key = signing_key(params.secret_key, &date_stamp, params.region, params.service);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, params.access_key, scope, SIGNED_HEADERS, signature
    )
}
