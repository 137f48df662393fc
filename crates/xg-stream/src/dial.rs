//! Opening the combined stream socket.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use xg_core::{RateLimiter, Result, XgError};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bounds how often this process opens new stream connections (5 per second).
static DIAL_LIMITER: RateLimiter = RateLimiter::new(Duration::from_millis(200));

/// Dial `endpoint` within `timeout`.
///
/// Every failure, including a malformed endpoint and a timeout, is reported
/// as [`XgError::Connection`]; cancellation as [`XgError::Canceled`].
pub async fn dial(endpoint: &str, timeout: Duration, cancel: &CancellationToken) -> Result<WsStream> {
    let host = validate_endpoint(endpoint)?;

    DIAL_LIMITER.acquire_or_cancel(cancel).await?;
    info!(%host, "[stream] connecting to {endpoint}");

    let dialed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(XgError::Canceled),
        dialed = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(endpoint)) => dialed,
    };

    match dialed {
        Ok(Ok((stream, response))) => {
            info!(%host, status = response.status().as_u16(), "[stream] connected");
            Ok(stream)
        }
        Ok(Err(e)) => {
            error!(%host, "[stream] connection failed: {e}");
            Err(XgError::Connection(format!("{endpoint}: {e}")))
        }
        Err(_) => {
            error!(%host, "[stream] connection timed out after {timeout:?}");
            Err(XgError::Connection(format!(
                "{endpoint}: dial timed out after {timeout:?}"
            )))
        }
    }
}

/// Check the endpoint is a `ws`/`wss` URL and return its host.
fn validate_endpoint(endpoint: &str) -> Result<String> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| XgError::Connection(format!("invalid endpoint {endpoint:?}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(XgError::Connection(format!(
                "unsupported endpoint scheme {other:?}"
            )));
        }
    }
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| XgError::Connection(format!("endpoint {endpoint:?} has no host")))
}
