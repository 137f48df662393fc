//! Combined stream transport.
//!
//! A [`Stream`] owns one WebSocket connection and exactly two tasks:
//!
//! 1. **sender**: drains the outbound queue in FIFO order, paced by a
//!    [`RateLimiter`], and writes one JSON frame per method call.
//! 2. **listener**: reads frames, routes replies to the [`Correlator`] and
//!    pushes to the [`Registry`].
//!
//! Any read, decode or write failure, or cancellation of the caller's token,
//! moves the stream to `Closing`. The sender then runs the teardown: close
//! the queue and the socket, fail every queued and in-flight call with
//! [`XgError::Closed`], and call `done` on every remaining handler. A closed
//! stream is never reopened; dial a new one.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use xg_core::config::StreamConfig;
use xg_core::{RateLimiter, Result, XgError};

use crate::correlator::{Correlator, Reply};
use crate::dial::{WsStream, dial};
use crate::handler::{ChannelHandler, PushHandler};
use crate::protocol::{
    InboundMessage, LIST_SUBSCRIPTIONS, OutboundMessage, SUBSCRIBE, UNSUBSCRIBE,
};
use crate::registry::Registry;

/// Upper bound for sending the close frame during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// State shared by the public handle and both tasks.
struct Shared {
    cancel: CancellationToken,
    queue: mpsc::Sender<OutboundMessage>,
    correlator: Correlator,
    registry: Registry,
    state: watch::Sender<StreamState>,
}

/// Handle to one combined stream connection.
///
/// All methods take `&self`; share the handle behind an `Arc` to use it from
/// several tasks. Dropping the handle cancels the stream.
pub struct Stream {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    request_timeout: Duration,
}

impl Stream {
    /// Dial the endpoint and start the listener and sender tasks.
    ///
    /// The stream closes when `parent` is cancelled. A dial failure returns
    /// [`XgError::Connection`] and no tasks are started.
    pub async fn connect(config: &StreamConfig, parent: &CancellationToken) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(StreamState::Connecting);

        let ws = dial(&config.endpoint, config.dial_timeout(), parent).await?;
        let (write, read) = ws.split();
        let (queue, queue_rx) = mpsc::channel(config.queue_capacity);

        let shared = Arc::new(Shared {
            cancel: parent.child_token(),
            queue,
            correlator: Correlator::new(),
            registry: Registry::new(),
            state,
        });
        shared.state.send_replace(StreamState::Active);

        let tracker = TaskTracker::new();
        tracker.spawn(listen(Arc::clone(&shared), read));
        tracker.spawn(send_queue(
            Arc::clone(&shared),
            write,
            queue_rx,
            RateLimiter::new(config.command_interval()),
        ));
        tracker.close();

        Ok(Self {
            shared,
            tracker,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    /// `true` once the stream started closing; every call then fails fast.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// A token that is cancelled when the stream starts closing.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Channels with an active local registration.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.registry.channels()
    }

    /// Issue a method call and wait for its reply.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(XgError::Closed);
        }

        let (id, reply) = self.shared.enqueue(method, params).await;
        await_reply(
            &self.shared.correlator,
            &self.shared.cancel,
            self.request_timeout,
            method,
            id,
            reply,
        )
        .await
    }

    /// Subscribe `handler` to `channel`.
    ///
    /// The handler is registered before the SUBSCRIBE call is sent, so no
    /// push is lost while the call is in flight. If the call fails, the
    /// registration is rolled back, `done` is called on the handler and the
    /// error is returned.
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn PushHandler>) -> Result<()> {
        if self.is_closed() {
            return Err(XgError::Closed);
        }

        let sub = self.shared.registry.try_register(channel, handler)?;

        match self.call(SUBSCRIBE, vec![Value::from(channel)]).await {
            Ok(_) => {
                info!(channel, "[stream] subscribed");
                Ok(())
            }
            Err(e) => {
                warn!(channel, "[stream] subscribe failed: {e}");
                if self.shared.registry.remove_if_same(channel, &sub) {
                    sub.finish().await;
                }
                Err(e)
            }
        }
    }

    /// Subscribe with a bounded channel instead of a handler.
    ///
    /// The receiver yields `None` after the subscription ends. While the
    /// buffer is full the listener blocks, delaying every channel on this
    /// stream, so size `buf_len` for bursts.
    pub async fn subscribe_channel(
        &self,
        channel: &str,
        buf_len: usize,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (handler, rx) = ChannelHandler::new(channel, buf_len);
        self.subscribe(channel, Arc::new(handler)).await?;
        Ok(rx)
    }

    /// Unsubscribe from `channel`.
    ///
    /// UNSUBSCRIBE is always sent. On success the local registration, if any,
    /// is removed and its handler's `done` is called; a channel that was never
    /// subscribed is not an error.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.call(UNSUBSCRIBE, vec![Value::from(channel)]).await?;

        if let Some(sub) = self.shared.registry.remove(channel) {
            sub.finish().await;
            info!(channel, "[stream] unsubscribed");
        } else {
            debug!(channel, "[stream] unsubscribed channel without local handler");
        }
        Ok(())
    }

    /// Ask the exchange which channels this connection is subscribed to.
    pub async fn list_subscriptions(&self) -> Result<Vec<String>> {
        let result = self.call(LIST_SUBSCRIPTIONS, Vec::new()).await?;
        serde_json::from_value(result)
            .map_err(|e| XgError::Protocol(format!("LIST_SUBSCRIPTIONS result: {e}")))
    }

    /// Wait until both tasks have finished.
    pub async fn closed(&self) {
        self.tracker.wait().await;
    }

    /// Cancel the stream and wait for the teardown to complete.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.tracker.wait().await;
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    /// Register a reply slot and queue the call.
    ///
    /// On an already-cancelled stream the slot is answered with
    /// [`XgError::Closed`] immediately and nothing is queued; the returned id
    /// is 0 in that case.
    async fn enqueue(&self, method: &str, params: Vec<Value>) -> (u64, oneshot::Receiver<Reply>) {
        if self.cancel.is_cancelled() {
            return (0, ready(Err(XgError::Closed)));
        }

        let (id, reply) = match self.correlator.add_pending() {
            Ok(pending) => pending,
            Err(e) => return (0, ready(Err(e))),
        };

        let mut msg = OutboundMessage::new(method, params);
        msg.id = id;

        let queued = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.queue.send(msg) => sent.is_ok(),
        };
        if !queued {
            self.correlator.deliver(id, Err(XgError::Closed));
        }

        (id, reply)
    }

    /// Route one decoded frame.
    async fn dispatch(&self, msg: InboundMessage) {
        match msg {
            InboundMessage::MethodError {
                id: Some(id),
                error,
            } => {
                let (code, text) = (error.code, error.msg.clone());
                if !self.correlator.deliver(id, Err(error.into())) {
                    warn!(id, code, msg = %text, "[stream] method error for unknown id");
                }
            }
            InboundMessage::MethodError { id: None, error } => {
                error!(code = error.code, msg = %error.msg, "[stream] protocol error without id");
            }
            InboundMessage::MethodResult { id, result } => {
                if !self.correlator.deliver(id, Ok(result)) {
                    warn!(id, "[stream] reply for unknown id");
                }
            }
            InboundMessage::Push { stream, data } => match self.registry.get(&stream) {
                Some(sub) => sub.deliver(data).await,
                None => warn!(channel = %stream, "[stream] unhandled push"),
            },
            InboundMessage::Unrecognized(raw) => {
                warn!(frame = %raw, "[stream] unhandled message");
            }
        }
    }

    /// Closing → Closed. Runs once, on the sender task.
    async fn teardown(
        &self,
        write: &mut SplitSink<WsStream, Message>,
        queue: &mut mpsc::Receiver<OutboundMessage>,
    ) {
        self.cancel.cancel();
        self.state.send_replace(StreamState::Closing);
        queue.close();

        match tokio::time::timeout(CLOSE_TIMEOUT, write.close()).await {
            Ok(Ok(())) => debug!("[stream] connection closed"),
            Ok(Err(e)) => debug!("[stream] close: {e}"),
            Err(_) => debug!("[stream] close timed out"),
        }

        let mut drained = 0;
        while let Ok(msg) = queue.try_recv() {
            if self.correlator.deliver(msg.id, Err(XgError::Closed)) {
                drained += 1;
            }
        }
        let in_flight = self.correlator.close();

        let subs = self.registry.close();
        let ended = subs.len();
        for sub in subs {
            sub.finish().await;
        }

        self.state.send_replace(StreamState::Closed);
        info!(drained, in_flight, subscriptions = ended, "[stream] closed");
    }
}

/// Wait for the reply to call `id`, giving up after `timeout`.
///
/// A timed-out call removes its slot. If the slot is already gone, a
/// delivery popped it first and the reply is awaited instead.
async fn await_reply(
    correlator: &Correlator,
    cancel: &CancellationToken,
    timeout: Duration,
    method: &str,
    id: u64,
    mut reply: oneshot::Receiver<Reply>,
) -> Reply {
    tokio::select! {
        biased;
        r = &mut reply => r.unwrap_or(Err(XgError::Closed)),
        _ = cancel.cancelled() => Err(XgError::Closed),
        _ = tokio::time::sleep(timeout) => {
            if correlator.pop(id).is_some() {
                warn!(id, method, "[stream] method call timed out");
                Err(XgError::Timeout(timeout))
            } else {
                reply.await.unwrap_or(Err(XgError::Closed))
            }
        }
    }
}

/// A reply slot that is already answered.
fn ready(reply: Reply) -> oneshot::Receiver<Reply> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(reply);
    rx
}

/// Listener task: read, decode, dispatch until cancelled or the socket fails.
async fn listen(shared: Arc<Shared>, mut read: SplitStream<WsStream>) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            frame = read.next() => frame,
        };

        // Pings are answered by tungstenite itself on the next read.
        let decoded = match frame {
            Some(Ok(Message::Text(text))) => InboundMessage::decode(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => InboundMessage::decode(&data),
            Some(Ok(Message::Close(frame))) => {
                warn!(?frame, "[stream] received close frame");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("[stream] read error: {e}");
                break;
            }
            None => {
                warn!("[stream] connection ended");
                break;
            }
        };

        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                error!("[stream] {e}");
                break;
            }
        };

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = shared.dispatch(msg) => {}
        }
    }

    shared.cancel.cancel();
}

/// Sender task: dequeue, rate-limit, write. Runs the teardown on exit.
async fn send_queue(
    shared: Arc<Shared>,
    mut write: SplitSink<WsStream, Message>,
    mut queue: mpsc::Receiver<OutboundMessage>,
    limiter: RateLimiter,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if limiter.acquire_or_cancel(&shared.cancel).await.is_err() {
            shared.correlator.deliver(msg.id, Err(XgError::Closed));
            break;
        }

        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                shared
                    .correlator
                    .deliver(msg.id, Err(XgError::Protocol(format!("encode {}: {e}", msg.method))));
                continue;
            }
        };

        debug!(id = msg.id, method = %msg.method, "[stream] send");
        let written = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                shared.correlator.deliver(msg.id, Err(XgError::Closed));
                break;
            }
            written = write.send(Message::Text(text.into())) => written,
        };

        if let Err(e) = written {
            let err = XgError::WebSocket(format!("stream send: {e}"));
            error!(id = msg.id, "[stream] {err}");
            shared.correlator.deliver(msg.id, Err(err));
            break;
        }
    }

    shared.teardown(&mut write, &mut queue).await;
}
