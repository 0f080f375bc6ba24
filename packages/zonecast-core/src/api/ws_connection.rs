//! WebSocket connection tracking.
//!
//! - `WsConnectionManager`: every open socket, by kind, with force-close
//! - `ConnectionGuard`: unregisters its socket when dropped

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// What a socket is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionKind {
    /// Realtime event subscriber (`/ws`).
    Subscriber,
    /// Live audio ingress (`/ws/mic`).
    Mic,
    /// Message broker bridge (`/ws/broker`).
    Broker,
}

impl ConnectionKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Subscriber => "ws",
            Self::Mic => "mic",
            Self::Broker => "broker",
        }
    }
}

/// Per-socket connection counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub subscribers: usize,
    pub mic: usize,
    pub broker: usize,
}

/// Tracks open WebSocket connections.
///
/// All connection tokens are children of one global token, so
/// [`close_all`](Self::close_all) reaches every handler at once.
pub struct WsConnectionManager {
    connections: DashMap<String, ConnectionKind>,
    next_id: AtomicU64,
    /// Replaced with a fresh token after `close_all()`.
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a connection; the guard unregisters it on drop.
    pub fn register(self: &Arc<Self>, kind: ConnectionKind) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("{}-{}", kind.prefix(), id);
        let cancel_token = self.global_cancel.read().child_token();

        self.connections.insert(conn_id.clone(), kind);
        log::info!(
            "[WS] Connection registered: {} (total: {})",
            conn_id,
            self.connections.len()
        );

        ConnectionGuard {
            id: conn_id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::info!(
                "[WS] Connection unregistered: {} (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn counts(&self) -> ConnectionCounts {
        let mut counts = ConnectionCounts::default();
        for entry in self.connections.iter() {
            match entry.value() {
                ConnectionKind::Subscriber => counts.subscribers += 1,
                ConnectionKind::Mic => counts.mic += 1,
                ConnectionKind::Broker => counts.broker += 1,
            }
        }
        counts
    }

    /// Signals every open connection to close. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters a connection when dropped, even if the handler bails early.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancelled on force-close.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_counts_by_kind() {
        let manager = Arc::new(WsConnectionManager::new());
        let a = manager.register(ConnectionKind::Subscriber);
        let _b = manager.register(ConnectionKind::Mic);
        let _c = manager.register(ConnectionKind::Broker);

        assert!(a.id().starts_with("ws-"));
        assert_eq!(
            manager.counts(),
            ConnectionCounts {
                subscribers: 1,
                mic: 1,
                broker: 1
            }
        );

        drop(a);
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(manager.counts().subscribers, 0);
    }

    #[test]
    fn close_all_cancels_existing_but_not_new_connections() {
        let manager = Arc::new(WsConnectionManager::new());
        let old = manager.register(ConnectionKind::Subscriber);

        assert_eq!(manager.close_all(), 1);
        assert!(old.cancel_token().is_cancelled());

        let fresh = manager.register(ConnectionKind::Subscriber);
        assert!(!fresh.cancel_token().is_cancelled());
    }
}
