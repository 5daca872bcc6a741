//! WebSocket layer: command routing, heartbeat, and the axum transport
//! adapter.
//!
//! The endpoint at `/ws` runs every accepted socket through a
//! [`connection::Connection`], which dispatches `{command, data}` envelopes
//! to registered handlers and monitors peer liveness with ping/pong.

pub mod commands;
pub mod connection;
pub mod envelope;
pub mod handler;
pub mod heartbeat;
pub mod router;
pub mod socket;

pub use connection::{Connection, RunOutcome};
pub use envelope::Envelope;
pub use heartbeat::{HeartbeatMonitor, HeartbeatState, Termination};
pub use router::{CommandRouter, Dispatch, MalformedFramePolicy, send_command, send_json};
pub use socket::{ChannelSocket, Frame, SendCallback, SendOptions, Socket, SocketEvent};
