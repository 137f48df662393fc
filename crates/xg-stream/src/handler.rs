//! Push handler capability.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, warn};

/// Receives the pushes of one subscribed channel.
///
/// `event` is called once per push, in arrival order, until `done` is
/// called exactly once. After `done` no further `event` calls are made.
/// A panic in either method is caught and logged by the stream; it does not
/// affect the connection or other channels.
#[async_trait]
pub trait PushHandler: Send + Sync + 'static {
    /// One complete JSON payload from the `data` field of a push frame.
    async fn event(&self, payload: Vec<u8>);

    /// The subscription ended (unsubscribe or stream shutdown).
    async fn done(&self);
}

/// How often a blocked [`ChannelHandler`] logs while it waits.
const BLOCKED_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// A [`PushHandler`] that forwards payloads into a bounded channel.
///
/// When the buffer is full the listener waits for room, logging a warning
/// every second it stays blocked. `done` drops the sender, so the receiver
/// yields `None` once it has drained.
pub struct ChannelHandler {
    channel: String,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl ChannelHandler {
    pub fn new(channel: impl Into<String>, buf_len: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(buf_len.max(1));
        let handler = Self {
            channel: channel.into(),
            tx: Mutex::new(Some(tx)),
        };
        (handler, rx)
    }
}

#[async_trait]
impl PushHandler for ChannelHandler {
    async fn event(&self, payload: Vec<u8>) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = tx else {
            return;
        };

        let start = Instant::now();
        let permit = loop {
            match tokio::time::timeout(BLOCKED_WARN_INTERVAL, tx.reserve()).await {
                Ok(Ok(permit)) => break permit,
                // Receiver gone; nobody is listening anymore.
                Ok(Err(_)) => return,
                Err(_) => warn!(
                    channel = %self.channel,
                    blocked = ?start.elapsed(),
                    "[stream] push channel blocked"
                ),
            }
        };
        permit.send(payload);
    }

    async fn done(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Run a handler future, containing any panic it raises.
///
/// Returns `false` if the handler panicked.
pub(crate) async fn guarded<F>(channel: &str, stage: &str, fut: F) -> bool
where
    F: Future<Output = ()>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => true,
        Err(panic) => {
            error!(
                channel,
                "[stream] push handler panicked in {stage}: {}",
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}
