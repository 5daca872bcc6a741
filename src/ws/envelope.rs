//! Command envelope carried in text frames.
//!
//! ```json
//! { "command": "<string>", "data": <any JSON value> }
//! ```

use serde::Serialize;
use serde_json::Value;

use crate::error::MalformedFrame;

/// Decoded command envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Command name used to look up the handler.
    pub command: String,
    /// Command payload handed to the handler.
    pub data: Value,
}

/// Borrowed envelope used on the outbound path to avoid copying `data`.
#[derive(Debug, Serialize)]
pub(crate) struct EnvelopeRef<'a, T: ?Sized> {
    pub(crate) command: &'a str,
    pub(crate) data: &'a T,
}

impl Envelope {
    /// Creates an envelope.
    #[must_use]
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    /// Decodes a text payload.
    ///
    /// A `command` that is not a non-empty string counts as missing, and so
    /// does a `data` field that is `null`.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame`] when the text is not JSON or either field
    /// is missing.
    pub fn decode(text: &str) -> Result<Self, MalformedFrame> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(MalformedFrame::MissingCommand);
        };

        let command = match fields.remove("command") {
            Some(Value::String(command)) if !command.is_empty() => command,
            _ => return Err(MalformedFrame::MissingCommand),
        };
        let data = match fields.remove("data") {
            None | Some(Value::Null) => return Err(MalformedFrame::MissingData),
            Some(data) => data,
        };

        Ok(Self { command, data })
    }

    /// Encodes the envelope as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
