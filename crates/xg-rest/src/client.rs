//! REST client with host failover and rate-limit cooldown.
//!
//! | Status            | Outcome                                              |
//! |-------------------|------------------------------------------------------|
//! | network error     | try next host; last error returned if all fail       |
//! | `>= 500`          | try next host; last status returned if all fail      |
//! | `200`             | success                                              |
//! | `429`, `418`      | arm the shared [`BackoffGate`], return `BackOff`     |
//! | anything else     | terminal `Request` error, no further hosts           |

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xg_core::config::RestConfig;
use xg_core::{Result, XgError};

use crate::backoff::{BackoffGate, MAX_COOLDOWN};

/// Connectivity probe endpoint.
pub const PATH_PING: &str = "/api/v3/ping";
/// Server clock endpoint.
pub const PATH_TIME: &str = "/api/v3/time";

/// Issues GET requests against an ordered list of equivalent hosts.
///
/// Cheap to clone; clones share the HTTP connection pool and the gate.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    hosts: Arc<[String]>,
    scheme: String,
    gate: Arc<BackoffGate>,
}

impl RestClient {
    /// Build a client that shares the process-wide [`BackoffGate`].
    pub fn new(config: &RestConfig) -> Result<Self> {
        Self::with_gate(config, BackoffGate::global())
    }

    /// Build a client bound to a specific gate.
    pub fn with_gate(config: &RestConfig, gate: Arc<BackoffGate>) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| XgError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            hosts: config.hosts.iter().cloned().collect(),
            scheme: config.scheme.clone(),
            gate,
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn gate(&self) -> &Arc<BackoffGate> {
        &self.gate
    }

    /// Try each host in order until one answers below 500.
    ///
    /// Returns that response unclassified. If every host fails, returns the
    /// last 5xx response or the last network error. Each attempt first waits
    /// on the backoff gate.
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        let path_and_query = build_path(path, query);
        let mut last = Err(XgError::Http("no hosts configured".into()));

        for host in self.hosts.iter() {
            if cancel.is_cancelled() {
                return Err(XgError::Canceled);
            }
            self.gate.wait(cancel).await?;

            let url = format!("{}://{host}{path_and_query}", self.scheme);
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(XgError::Canceled),
                sent = self.http.get(&url).send() => sent,
            };

            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    debug!(
                        host = %host,
                        status = status.as_u16(),
                        content_length = ?resp.content_length(),
                        "[rest] GET {path}"
                    );
                    if status.as_u16() < 500 {
                        return Ok(resp);
                    }
                    warn!(host = %host, status = status.as_u16(), "[rest] server error, trying next host");
                    last = Ok(resp);
                }
                Err(e) => {
                    warn!(host = %host, "[rest] GET {path} failed: {e}");
                    last = Err(XgError::Http(e.to_string()));
                }
            }
        }

        last
    }

    /// Perform a GET and classify the status.
    ///
    /// Only a `200` response is returned as `Ok`. A `429` or `418` arms the
    /// shared gate for the `Retry-After` seconds and yields
    /// [`XgError::BackOff`].
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        let resp = self.fetch(cancel, path, query).await?;
        let status = resp.status();

        if status == StatusCode::OK {
            return Ok(resp);
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let duration = retry_after(&resp)?;
            self.gate.arm(duration);
            return Err(XgError::BackOff {
                status: status.as_u16(),
                duration,
            });
        }

        Err(XgError::Request {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
        })
    }

    /// Perform a GET and decode the `200` JSON body into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let resp = self.get(cancel, path, query).await?;
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(XgError::Canceled),
            body = resp.bytes() => body.map_err(|e| XgError::Http(e.to_string()))?,
        };
        serde_json::from_slice(&body).map_err(|e| XgError::Protocol(format!("{path}: {e}")))
    }

    /// Check that at least one host is reachable.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let _: serde_json::Value = self.get_json(cancel, PATH_PING, &[]).await?;
        info!("[rest] ping ok");
        Ok(())
    }

    /// Exchange server time in milliseconds since the Unix epoch.
    pub async fn server_time(&self, cancel: &CancellationToken) -> Result<u64> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ServerTime {
            server_time: u64,
        }

        let resp: ServerTime = self.get_json(cancel, PATH_TIME, &[]).await?;
        Ok(resp.server_time)
    }
}

/// Read the cooldown from the `Retry-After` header (whole seconds), capped
/// at [`MAX_COOLDOWN`].
fn retry_after(resp: &Response) -> Result<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_COOLDOWN))
        .ok_or_else(|| {
            XgError::Protocol(format!(
                "status {} without a valid Retry-After header",
                resp.status().as_u16()
            ))
        })
}

/// URL-encode `(key, value)` pairs into a query string (no leading `?`).
pub fn encode_query(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn build_path(path: &str, query: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);
    if !query.is_empty() {
        out.push('?');
        out.push_str(&encode_query(query));
    }
    out
}
