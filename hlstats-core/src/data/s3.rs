//! S3 object fetcher.
//!
//! GETs objects over HTTPS with AWS Signature Version 4, optionally as a
//! requester-pays request. Transient failures (throttling, 5xx, connection
//! errors) are retried with exponential backoff plus jitter; the shared
//! circuit breaker stops a run from hammering a store that keeps failing.

use super::circuit_breaker::CircuitBreaker;
use super::fetch::{FetchError, ObjectFetcher};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Key requested by `verify`. It does not need to exist.
const PROBE_KEY: &str = "hlstats-connectivity-check";

/// S3 error codes that mean the credentials themselves were rejected.
const REJECTED_CREDENTIALS: &[&str] = &[
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
    "TokenRefreshRequired",
];

/// Static access keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where and how to reach the bucket.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (path-style addressing). `None` uses AWS virtual-hosted style.
    pub endpoint: Option<String>,
    pub requester_pays: bool,
    pub credentials: Option<S3Credentials>,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl S3Settings {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            requester_pays: false,
            credentials: None,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Object fetcher backed by S3 (or any SigV4-compatible store).
pub struct S3ObjectFetcher {
    client: reqwest::blocking::Client,
    settings: S3Settings,
    circuit_breaker: Arc<CircuitBreaker>,
}

/// Host, canonical URI and full URL of one object request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    canonical_uri: String,
    url: String,
}

impl S3ObjectFetcher {
    pub fn new(
        settings: S3Settings,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| FetchError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            circuit_breaker,
        })
    }

    fn target(&self, key: &str) -> Target {
        let key = uri_encode(key, false);
        match &self.settings.endpoint {
            Some(endpoint) => {
                let endpoint = endpoint.trim_end_matches('/');
                let host = endpoint
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(endpoint)
                    .to_string();
                let canonical_uri = format!("/{}/{key}", uri_encode(&self.settings.bucket, true));
                Target {
                    url: format!("{endpoint}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    self.settings.bucket, self.settings.region
                );
                let canonical_uri = format!("/{key}");
                Target {
                    url: format!("https://{host}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    fn request_headers(&self, target: &Target, now: DateTime<Utc>) -> Vec<(String, String)> {
        let mut headers = vec![("host".to_string(), target.host.clone())];
        if self.settings.requester_pays {
            headers.push(("x-amz-request-payer".into(), "requester".into()));
        }
        match &self.settings.credentials {
            Some(creds) => sign_request(
                creds,
                &self.settings.region,
                &target.canonical_uri,
                headers,
                UNSIGNED_PAYLOAD,
                now,
            ),
            None => headers,
        }
    }

    fn send(&self, target: &Target) -> reqwest::Result<reqwest::blocking::Response> {
        let mut request = self.client.get(&target.url);
        for (name, value) in self.request_headers(target, Utc::now()) {
            if name != "host" {
                request = request.header(name, value);
            }
        }
        request.send()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.base_delay * 2u32.pow(attempt.saturating_sub(1));
        let jitter_ms = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl ObjectFetcher for S3ObjectFetcher {
    fn name(&self) -> &str {
        "s3"
    }

    fn fetch(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        let target = self.target(key);
        let mut last_error = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.backoff(attempt));
            }
            if !self.circuit_breaker.is_allowed() {
                debug!(
                    key,
                    cooldown_ms = self.circuit_breaker.remaining_cooldown().as_millis() as u64,
                    "circuit breaker open"
                );
                return Err(FetchError::CircuitOpen);
            }

            let resp = match self.send(&target) {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(FetchError::Unreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(FetchError::Unreachable(e.to_string())),
            };

            let status = resp.status();
            if status.is_success() {
                let body = resp.bytes().map_err(|e| FetchError::Unreadable {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                self.circuit_breaker.record_success();
                debug!(key, bytes = body.len(), attempt, "fetched object");
                return Ok(body.to_vec());
            }

            match status {
                reqwest::StatusCode::NOT_FOUND => {
                    self.circuit_breaker.record_success();
                    return Err(FetchError::NotFound {
                        key: key.to_string(),
                    });
                }
                // S3 answers 403 for missing keys when ListBucket is not granted;
                // these never count against the breaker.
                reqwest::StatusCode::FORBIDDEN | reqwest::StatusCode::UNAUTHORIZED => {
                    return Err(FetchError::Denied {
                        key: key.to_string(),
                        reason: format!("HTTP {status}"),
                    });
                }
                s if s == reqwest::StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(FetchError::Unreachable(format!("HTTP {s} for {key}")));
                }
                s => {
                    return Err(FetchError::Unreachable(format!("HTTP {s} for {key}")));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::Unreachable("max retries exceeded".into())))
    }

    /// One signed GET for a key that need not exist. Not found, or access
    /// denied for it, proves the store answers and accepts the signature.
    fn verify(&self) -> Result<(), FetchError> {
        let resp = self
            .send(&self.target(PROBE_KEY))
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        probe_outcome(status, &body)
    }
}

fn probe_outcome(status: reqwest::StatusCode, body: &str) -> Result<(), FetchError> {
    use reqwest::StatusCode;

    let denied = |reason: String| FetchError::Denied {
        key: PROBE_KEY.to_string(),
        reason,
    };
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    match (status, error_code(body)) {
        (StatusCode::FORBIDDEN, Some(code)) if REJECTED_CREDENTIALS.contains(&code) => {
            Err(denied(format!("credentials rejected ({code})")))
        }
        (StatusCode::FORBIDDEN, _) => Ok(()),
        (StatusCode::UNAUTHORIZED, _) => Err(denied(format!("HTTP {status}"))),
        (s, _) => Err(FetchError::Unreachable(format!("HTTP {s} for {PROBE_KEY}"))),
    }
}

/// `<Code>` of an S3 XML error body.
fn error_code(body: &str) -> Option<&str> {
    let (_, rest) = body.split_once("<Code>")?;
    rest.split_once("</Code>").map(|(code, _)| code.trim())
}

/// Sign a body-less GET. Returns the input headers plus the `x-amz-*` and
/// `authorization` headers, all lowercase.
fn sign_request(
    creds: &S3Credentials,
    region: &str,
    canonical_uri: &str,
    mut headers: Vec<(String, String)>,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    headers.push(("x-amz-content-sha256".into(), payload_hash.into()));
    headers.push(("x-amz-date".into(), amz_date.clone()));
    if let Some(token) = &creds.session_token {
        headers.push(("x-amz-security-token".into(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request =
        format!("GET\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");
    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("AWS4{}", creds.secret_access_key).as_bytes(), &date);
    let k_region = hmac(&k_date, region);
    let k_service = hmac(&k_region, SERVICE);
    let k_signing = hmac(&k_service, "aws4_request");
    let signature = hex::encode(hmac(&k_signing, &string_to_sign));

    headers.push((
        "authorization".into(),
        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key_id
        ),
    ));
    headers
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode everything outside the unreserved set. `/` survives unless
/// `encode_slash` is set.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
