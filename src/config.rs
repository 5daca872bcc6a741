//! Server configuration loaded from environment variables.
//!
//! All settings come from environment variables (or a `.env` file via
//! `dotenvy`). Unset or unparsable values fall back to defaults, except
//! `LISTEN_ADDR`, which must parse if set.

use std::net::SocketAddr;
use std::time::Duration;

use crate::ws::router::MalformedFramePolicy;

/// Top-level server configuration.
///
/// Loaded once at startup via [`ServerConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:3000`).
    pub listen_addr: SocketAddr,

    /// Whether every WebSocket connection runs a heartbeat monitor.
    pub heartbeat_enabled: bool,

    /// Period between heartbeat pings.
    pub heartbeat_interval: Duration,

    /// Time allowed for a pong. `None` means "same as the interval".
    pub heartbeat_timeout: Option<Duration>,

    /// Policy for text frames that are not command envelopes.
    pub malformed_frame_policy: MalformedFramePolicy,

    /// Capacity of each connection's outbound frame queue.
    pub send_buffer_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: None,
            malformed_frame_policy: MalformedFramePolicy::Drop,
            send_buffer_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `LISTEN_ADDR` is set but cannot be parsed as
    /// a [`SocketAddr`].
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`ServerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let listen_addr = match lookup("LISTEN_ADDR") {
            Some(addr) => addr.parse()?,
            None => defaults.listen_addr,
        };

        let heartbeat_enabled =
            parse_bool(lookup("HEARTBEAT_ENABLED"), defaults.heartbeat_enabled);
        let heartbeat_interval =
            parse_millis(lookup("HEARTBEAT_INTERVAL_MS")).unwrap_or(defaults.heartbeat_interval);
        let heartbeat_timeout = parse_millis(lookup("HEARTBEAT_TIMEOUT_MS"));

        let malformed_frame_policy = parse_or(
            lookup("MALFORMED_FRAME_POLICY"),
            defaults.malformed_frame_policy,
        );
        let send_buffer_capacity = parse_or(
            lookup("SEND_BUFFER_CAPACITY"),
            defaults.send_buffer_capacity,
        );

        Ok(Self {
            listen_addr,
            heartbeat_enabled,
            heartbeat_interval,
            heartbeat_timeout,
            malformed_frame_policy,
            send_buffer_capacity,
        })
    }
}

/// Parses `value` as `T`, returning `default` on missing or invalid values.
fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parses a millisecond count into a [`Duration`].
fn parse_millis(value: Option<String>) -> Option<Duration> {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Parses a boolean. Accepts `"true"`, `"1"`, `"false"`, `"0"`
/// (case-insensitive). Returns `default` otherwise.
fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}
