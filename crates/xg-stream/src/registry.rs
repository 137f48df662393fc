//! Channel → handler registry.
//!
//! Each registration is wrapped in a [`Subscription`] that serializes calls
//! into its handler, so `done` can never overlap or precede an `event` that
//! is still running, and it fires at most once.

use std::sync::{Arc, Mutex, PoisonError};

use ahash::AHashMap;
use tracing::debug;
use xg_core::{Result, XgError};

use crate::handler::{PushHandler, guarded};

/// One active channel registration.
pub struct Subscription {
    channel: String,
    handler: Arc<dyn PushHandler>,
    /// `true` once `done` has been called.
    finished: tokio::sync::Mutex<bool>,
}

impl Subscription {
    fn new(channel: String, handler: Arc<dyn PushHandler>) -> Self {
        Self {
            channel,
            handler,
            finished: tokio::sync::Mutex::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Hand one payload to the handler, unless the subscription has ended.
    pub async fn deliver(&self, payload: Vec<u8>) {
        let finished = self.finished.lock().await;
        if *finished {
            debug!(channel = %self.channel, "[stream] push after done dropped");
            return;
        }
        guarded(&self.channel, "event", self.handler.event(payload)).await;
    }

    /// Call `done` on the handler if it has not been called yet.
    ///
    /// Returns `true` if this call ended the subscription.
    pub async fn finish(&self) -> bool {
        let mut finished = self.finished.lock().await;
        if *finished {
            return false;
        }
        *finished = true;
        guarded(&self.channel, "done", self.handler.done()).await;
        true
    }
}

#[derive(Default)]
struct State {
    subs: AHashMap<String, Arc<Subscription>>,
    closed: bool,
}

/// Concurrency-safe map of channel name to [`Subscription`].
#[derive(Default)]
pub struct Registry {
    state: Mutex<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check that `channel` is free and register `handler`.
    pub fn try_register(
        &self,
        channel: &str,
        handler: Arc<dyn PushHandler>,
    ) -> Result<Arc<Subscription>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(XgError::Closed);
        }
        if state.subs.contains_key(channel) {
            return Err(XgError::AlreadySubscribed(channel.to_string()));
        }
        let sub = Arc::new(Subscription::new(channel.to_string(), handler));
        state.subs.insert(channel.to_string(), Arc::clone(&sub));
        Ok(sub)
    }

    pub fn get(&self, channel: &str) -> Option<Arc<Subscription>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subs
            .get(channel)
            .cloned()
    }

    pub fn remove(&self, channel: &str) -> Option<Arc<Subscription>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subs
            .remove(channel)
    }

    /// Remove `channel` only if it still maps to `sub`.
    pub fn remove_if_same(&self, channel: &str, sub: &Arc<Subscription>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.subs.get(channel) {
            Some(current) if Arc::ptr_eq(current, sub) => {
                state.subs.remove(channel);
                true
            }
            _ => false,
        }
    }

    /// Refuse further registrations and hand back everything registered.
    pub fn close(&self) -> Vec<Arc<Subscription>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.subs.drain().map(|(_, sub)| sub).collect()
    }

    /// Registered channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subs
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subs
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct Counting {
        events: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl PushHandler for Counting {
        async fn event(&self, _payload: Vec<u8>) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        async fn done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let reg = Registry::new();
        reg.try_register("a", Arc::new(Counting::default())).unwrap();
        let err = reg
            .try_register("a", Arc::new(Counting::default()))
            .err()
            .unwrap();
        assert_eq!(err, XgError::AlreadySubscribed("a".into()));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn finish_runs_done_once_and_stops_events() {
        let handler = Arc::new(Counting::default());
        let reg = Registry::new();
        let sub = reg.try_register("a", handler.clone()).unwrap();

        sub.deliver(b"{}".to_vec()).await;
        assert!(sub.finish().await);
        assert!(!sub.finish().await);
        sub.deliver(b"{}".to_vec()).await;

        assert_eq!(handler.events.load(Ordering::SeqCst), 1);
        assert_eq!(handler.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_if_same_ignores_replacement() {
        let reg = Registry::new();
        let old = reg.try_register("a", Arc::new(Counting::default())).unwrap();
        reg.remove("a");
        let _new = reg.try_register("a", Arc::new(Counting::default())).unwrap();

        assert!(!reg.remove_if_same("a", &old));
        assert_eq!(reg.channels(), vec!["a".to_string()]);
    }

    #[test]
    fn close_drains_and_refuses() {
        let reg = Registry::new();
        reg.try_register("b", Arc::new(Counting::default())).unwrap();
        reg.try_register("a", Arc::new(Counting::default())).unwrap();
        assert_eq!(reg.channels(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(reg.close().len(), 2);
        assert!(reg.is_empty());
        assert_eq!(
            reg.try_register("c", Arc::new(Counting::default()))
                .err()
                .unwrap(),
            XgError::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_has_one_winner() {
        let reg = Arc::new(Registry::new());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move {
                    reg.try_register("x", Arc::new(Counting::default())).is_ok()
                })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
