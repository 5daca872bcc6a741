//! The transport capability the extension layer is attached to.
//!
//! [`Socket`] is the minimal outbound surface (send and ping); inbound
//! traffic arrives as [`SocketEvent`]s. [`ChannelSocket`] implements
//! [`Socket`] over a bounded channel drained by a separate writer task, so
//! neither operation ever blocks the connection task.

use std::fmt;

use tokio::sync::mpsc;

use crate::error::SocketError;

/// Completion callback for [`Socket::send`].
///
/// Invoked once the frame has been written, or with the transport error that
/// prevented it.
pub type SendCallback = Box<dyn FnOnce(Result<(), SocketError>) + Send>;

/// Per-send options passed through unchanged to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Send the payload as a binary frame instead of a text frame.
    pub binary: bool,
}

impl SendOptions {
    /// Options for a text frame.
    #[must_use]
    pub const fn text() -> Self {
        Self { binary: false }
    }

    /// Options for a binary frame.
    #[must_use]
    pub const fn binary() -> Self {
        Self { binary: true }
    }
}

/// An inbound data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// Returns `true` for binary frames.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

/// Events delivered by the transport for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A data frame arrived.
    Message(Frame),
    /// The peer answered a ping.
    Pong,
    /// The connection was closed.
    Close,
    /// The transport reported an error.
    Error(SocketError),
}

/// Outbound capability of a live connection.
pub trait Socket {
    /// Queues `payload` for sending.
    ///
    /// `callback`, if given, is invoked once the write completes or fails.
    /// It is not invoked when this method itself returns an error.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError`] if the frame could not be queued.
    fn send(
        &self,
        payload: String,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), SocketError>;

    /// Queues a ping control frame.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError`] if the ping could not be queued.
    fn ping(&self, payload: Vec<u8>, mask: bool) -> Result<(), SocketError>;
}

/// Frame queued on a [`ChannelSocket`] for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Text data frame.
    Text(String),
    /// Binary data frame.
    Binary(Vec<u8>),
    /// Ping control frame. `mask` is honoured by client-side transports;
    /// servers never mask.
    Ping {
        /// Ping payload.
        payload: Vec<u8>,
        /// Whether the frame should be masked.
        mask: bool,
    },
    /// Close frame.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// A queued frame plus its optional completion callback.
pub struct Outbound {
    /// The frame to write.
    pub frame: OutboundFrame,
    callback: Option<SendCallback>,
}

impl Outbound {
    /// Reports the write result to the sender's callback, if any.
    pub fn complete(self, result: Result<(), SocketError>) {
        self.into_parts().1.complete(result);
    }

    /// Splits into the frame and the handle used to report its write result.
    #[must_use]
    pub fn into_parts(self) -> (OutboundFrame, Completion) {
        (self.frame, Completion(self.callback))
    }
}

/// Reports the result of writing one [`Outbound`] frame.
pub struct Completion(Option<SendCallback>);

impl Completion {
    /// Invokes the sender's callback, if any, with `result`.
    pub fn complete(self, result: Result<(), SocketError>) {
        if let Some(callback) = self.0 {
            callback(result);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completion")
            .field(&self.0.is_some())
            .finish()
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("frame", &self.frame)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// [`Socket`] backed by a bounded `mpsc` channel.
///
/// Cloning yields another handle to the same outbound queue; the writer task
/// stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSocket {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelSocket {
    /// Creates a socket and the receiving end for its writer task.
    ///
    /// A zero `capacity` is raised to 1.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a close frame.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError`] if the frame could not be queued.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), SocketError> {
        self.enqueue(
            OutboundFrame::Close {
                code,
                reason: reason.into(),
            },
            None,
        )
    }

    /// Returns `true` once the writer side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn enqueue(
        &self,
        frame: OutboundFrame,
        callback: Option<SendCallback>,
    ) -> Result<(), SocketError> {
        self.tx
            .try_send(Outbound { frame, callback })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SocketError::BufferFull,
                mpsc::error::TrySendError::Closed(_) => SocketError::Closed,
            })
    }
}

impl Socket for ChannelSocket {
    fn send(
        &self,
        payload: String,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), SocketError> {
        let frame = if options.binary {
            OutboundFrame::Binary(payload.into_bytes())
        } else {
            OutboundFrame::Text(payload)
        };
        self.enqueue(frame, callback)
    }

    fn ping(&self, payload: Vec<u8>, mask: bool) -> Result<(), SocketError> {
        self.enqueue(OutboundFrame::Ping { payload, mask }, None)
    }
}
