//! Command table and inbound dispatch, plus the outbound JSON helpers.
//!
//! Inbound text frames are decoded as [`Envelope`]s and routed to the
//! handler registered for their `command`. Binary frames are never parsed.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::envelope::{Envelope, EnvelopeRef};
use super::socket::{Frame, SendCallback, SendOptions, Socket};
use crate::error::{DispatchError, MalformedFrame, SendError};

/// Handler invoked with the `data` of a matching envelope.
pub type CommandHandler = Box<dyn FnMut(Value) -> anyhow::Result<()> + Send>;

/// What to do with text frames that are not command envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedFramePolicy {
    /// Drop the frame silently.
    #[default]
    Drop,
    /// Return [`DispatchError::Malformed`] to the caller.
    Reject,
}

impl FromStr for MalformedFramePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown malformed frame policy: {other}")),
        }
    }
}

/// Result of dispatching a single inbound frame.
#[derive(Debug)]
pub enum Dispatch {
    /// The registered handler ran successfully.
    Handled,
    /// The frame was binary and was not inspected.
    IgnoredBinary,
    /// The frame was not a command envelope and was dropped.
    Dropped(MalformedFrame),
}

/// Routes command envelopes to registered handlers.
///
/// At most one handler is active per command; registering a command again
/// replaces the previous handler.
#[derive(Default)]
pub struct CommandRouter {
    handlers: HashMap<String, CommandHandler>,
    policy: MalformedFramePolicy,
}

impl CommandRouter {
    /// Creates an empty router that drops malformed frames.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty router with the given malformed frame policy.
    #[must_use]
    pub fn with_policy(policy: MalformedFramePolicy) -> Self {
        Self {
            handlers: HashMap::new(),
            policy,
        }
    }

    /// Registers `handler` for `command`.
    ///
    /// Returns `true` if a previous handler was replaced.
    pub fn on_command<F>(&mut self, command: impl Into<String>, handler: F) -> bool
    where
        F: FnMut(Value) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers
            .insert(command.into(), Box::new(handler))
            .is_some()
    }

    /// Returns `true` if a handler is registered for `command`.
    #[must_use]
    pub fn has_command(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Registered command names, sorted.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no command is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatches one inbound frame.
    ///
    /// The handler runs synchronously on the caller's task.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnregisteredCommand`] if no handler matches.
    /// - [`DispatchError::Handler`] if the handler fails.
    /// - [`DispatchError::Malformed`] for non-envelope frames under
    ///   [`MalformedFramePolicy::Reject`].
    pub fn dispatch(&mut self, frame: &Frame) -> Result<Dispatch, DispatchError> {
        let text = match frame {
            Frame::Binary(_) => return Ok(Dispatch::IgnoredBinary),
            Frame::Text(text) => text,
        };

        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(reason) => {
                return match self.policy {
                    MalformedFramePolicy::Drop => {
                        debug!(%reason, "dropping non-command frame");
                        Ok(Dispatch::Dropped(reason))
                    }
                    MalformedFramePolicy::Reject => Err(reason.into()),
                };
            }
        };

        let Envelope { command, data } = envelope;
        let Some(handler) = self.handlers.get_mut(&command) else {
            return Err(DispatchError::UnregisteredCommand(command));
        };

        debug!(command, "dispatching command");
        handler(data).map_err(|source| DispatchError::Handler { command, source })?;
        Ok(Dispatch::Handled)
    }
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRouter")
            .field("commands", &self.commands())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Serializes `data` and sends it over `socket`.
///
/// `options` and `callback` are passed to [`Socket::send`] unchanged.
///
/// # Errors
///
/// Returns [`SendError::Serialize`] if `data` cannot be serialized and
/// [`SendError::Socket`] if the transport rejects the frame.
pub fn send_json<S, T>(
    socket: &S,
    data: &T,
    options: SendOptions,
    callback: Option<SendCallback>,
) -> Result<(), SendError>
where
    S: Socket + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_string(data)?;
    socket.send(payload, options, callback)?;
    Ok(())
}

/// Sends `{"command": command, "data": data}` over `socket`.
///
/// # Errors
///
/// Same as [`send_json`].
pub fn send_command<S, T>(
    socket: &S,
    command: &str,
    data: &T,
    options: SendOptions,
    callback: Option<SendCallback>,
) -> Result<(), SendError>
where
    S: Socket + ?Sized,
    T: Serialize + ?Sized,
{
    send_json(socket, &EnvelopeRef { command, data }, options, callback)
}
