use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

/// Outbound half of a client socket. Kept behind a trait so the bridges can
/// be exercised against a recording channel instead of a live socket.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Sends one already-rendered message. `false` means the socket is gone
    /// and the caller should trigger teardown.
    async fn send_text(&self, text: String) -> bool;

    /// Liveness probe. `false` means the socket is gone.
    async fn send_ping(&self) -> bool;

    /// Best-effort close notification to the client.
    async fn send_close(&self);
}

/// Implemented by per-connection session state. Must be idempotent and
/// non-blocking: releasing an already-released session is a no-op.
pub trait SessionTeardown: Send + Sync + 'static {
    fn teardown(&self);
}

/// Process-wide map from bot id to live connection state for one socket
/// kind. Terminal and metrics connections each get their own registry, so a
/// bot may have either or both open.
pub struct ConnectionRegistry<S: SessionTeardown> {
    connections: DashMap<String, Arc<S>>,
}

impl<S: SessionTeardown> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Registers a session under its bot id. Last connector wins: an entry
    /// already present for the id is removed and torn down.
    pub fn insert(&self, bot_id: &str, session: Arc<S>) {
        if let Some(previous) = self.connections.insert(bot_id.to_string(), session) {
            previous.teardown();
        }
    }

    /// Removes the entry and tears the session down. The removal is
    /// conditional on identity, so a stale release from a replaced session
    /// cannot evict its replacement. Safe to call any number of times.
    pub fn release(&self, bot_id: &str, session: &Arc<S>) {
        self.connections
            .remove_if(bot_id, |_, current| Arc::ptr_eq(current, session));
        session.teardown();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<S: SessionTeardown> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Channel that records every outbound message, with a switchable
    /// "socket gone" mode.
    #[derive(Default)]
    pub struct RecordingChannel {
        pub messages: Mutex<Vec<String>>,
        pub pings: Mutex<usize>,
        pub broken: AtomicBool,
    }

    impl RecordingChannel {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn snapshot(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }

        pub fn break_channel(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ClientChannel for RecordingChannel {
        async fn send_text(&self, text: String) -> bool {
            if self.broken.load(Ordering::SeqCst) {
                return false;
            }
            self.messages.lock().unwrap().push(text);
            true
        }

        async fn send_ping(&self) -> bool {
            if self.broken.load(Ordering::SeqCst) {
                return false;
            }
            *self.pings.lock().unwrap() += 1;
            true
        }

        async fn send_close(&self) {}
    }
}
