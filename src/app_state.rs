//! Shared application state injected into all Axum handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ServerConfig;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Number of WebSocket connections currently being served.
    active_connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Creates the state for `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of WebSocket connections currently being served.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Counts a connection as active until the returned guard is dropped.
    #[must_use]
    pub fn track_connection(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counter: Arc::clone(&self.active_connections),
        }
    }
}

/// Keeps a connection counted in [`AppState::active_connections`].
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
