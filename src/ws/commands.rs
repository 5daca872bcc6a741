//! Built-in commands served on every `/ws` connection.
//!
//! | Command | Reply |
//! |---------|-------|
//! | `echo`  | `{"command":"echo","data":<data>}` |
//! | `ping`  | `{"command":"pong","data":<data>}` |
//! | `time`  | `{"command":"time","data":{"now":"<RFC 3339>"}}` |

use chrono::Utc;
use serde_json::json;

use super::connection::Connection;
use super::router::send_command;
use super::socket::{SendOptions, Socket};

/// Registers the built-in commands on `connection`.
///
/// Handlers reply through a clone of the connection's socket.
pub fn register_builtin<S>(connection: &mut Connection<S>)
where
    S: Socket + Clone + Send + 'static,
{
    let socket = connection.socket().clone();
    connection.on_command("echo", move |data| {
        send_command(&socket, "echo", &data, SendOptions::text(), None)?;
        Ok(())
    });

    let socket = connection.socket().clone();
    connection.on_command("ping", move |data| {
        send_command(&socket, "pong", &data, SendOptions::text(), None)?;
        Ok(())
    });

    let socket = connection.socket().clone();
    connection.on_command("time", move |_| {
        let data = json!({ "now": Utc::now().to_rfc3339() });
        send_command(&socket, "time", &data, SendOptions::text(), None)?;
        Ok(())
    });
}
