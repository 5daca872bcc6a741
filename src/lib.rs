//! # ws-command
//!
//! Command routing and heartbeat liveness monitoring layered on top of a
//! live WebSocket connection.
//!
//! Text frames carrying `{"command": ..., "data": ...}` envelopes are
//! dispatched to per-command handlers, and a ping/pong heartbeat reports an
//! unresponsive peer exactly once. Both pieces depend only on the small
//! [`ws::Socket`] capability and are attached per connection through
//! [`ws::Connection`]; nothing is shared between connections.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket)
//!     │
//!     ├── Axum upgrade + adapter (ws::handler)
//!     │
//!     ├── Connection (ws::connection) ── one task per socket
//!     │     ├── CommandRouter (ws::router) + Envelope (ws::envelope)
//!     │     └── HeartbeatMonitor (ws::heartbeat)
//!     │
//!     └── ChannelSocket (ws::socket) → writer task → socket sink
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod ws;
