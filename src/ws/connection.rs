//! Per-connection wrapper tying the command router and the heartbeat to one
//! socket.
//!
//! A [`Connection`] owns its socket handle, a [`CommandRouter`] built at
//! construction time and at most one [`HeartbeatMonitor`]. Nothing is shared
//! between connections. [`Connection::run`] is the single task that handles
//! every socket event and timer firing for the connection, one at a time.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::heartbeat::{HeartbeatMonitor, HeartbeatState, HeartbeatTimer, Termination};
use super::router::{self, CommandRouter, MalformedFramePolicy};
use super::socket::{SendCallback, SendOptions, Socket, SocketEvent};
use crate::error::{ConnectionError, SendError};

/// How a [`Connection::run`] ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The transport closed or the event stream ended.
    Closed,
    /// The heartbeat watchdog expired.
    HeartbeatExpired,
}

/// A live socket extended with command routing and heartbeat monitoring.
#[derive(Debug)]
pub struct Connection<S> {
    socket: S,
    router: CommandRouter,
    heartbeat: Option<HeartbeatMonitor>,
}

impl<S: Socket> Connection<S> {
    /// Wraps `socket` with a router that drops malformed frames.
    #[must_use]
    pub fn new(socket: S) -> Self {
        Self::with_policy(socket, MalformedFramePolicy::Drop)
    }

    /// Wraps `socket` with the given malformed frame policy.
    #[must_use]
    pub fn with_policy(socket: S, policy: MalformedFramePolicy) -> Self {
        Self {
            socket,
            router: CommandRouter::with_policy(policy),
            heartbeat: None,
        }
    }

    /// The wrapped socket.
    #[must_use]
    pub const fn socket(&self) -> &S {
        &self.socket
    }

    /// The command router.
    #[must_use]
    pub const fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Registers `handler` for `command`, replacing any previous handler.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn on_command<F>(&mut self, command: impl Into<String>, handler: F) -> bool
    where
        F: FnMut(Value) -> anyhow::Result<()> + Send + 'static,
    {
        self.router.on_command(command, handler)
    }

    /// Serializes `data` and sends it.
    ///
    /// # Errors
    ///
    /// See [`router::send_json`].
    pub fn send_json<T>(
        &self,
        data: &T,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        router::send_json(&self.socket, data, options, callback)
    }

    /// Sends a `{command, data}` envelope.
    ///
    /// # Errors
    ///
    /// See [`router::send_command`].
    pub fn send_command<T>(
        &self,
        command: &str,
        data: &T,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        router::send_command(&self.socket, command, data, options, callback)
    }

    /// Starts heartbeat monitoring.
    ///
    /// `on_timeout` is invoked exactly once, when the peer stops answering
    /// pings within `ping_timeout` (default: `interval`) or the transport
    /// closes or errors. It is the only signal that monitoring has ended.
    /// Calling this again closes the current monitor with
    /// [`Termination::Replaced`], firing its callback, before starting the
    /// new one.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn monitor<F>(&mut self, interval: Duration, on_timeout: F, ping_timeout: Option<Duration>)
    where
        F: FnOnce() + Send + 'static,
    {
        let next = HeartbeatMonitor::new(interval, on_timeout, ping_timeout);
        if let Some(mut previous) = self.heartbeat.replace(next) {
            if previous.terminate(Termination::Replaced) {
                warn!("replaced active heartbeat monitor");
            }
        }
    }

    /// Current heartbeat state, [`HeartbeatState::Idle`] if not monitoring.
    #[must_use]
    pub const fn heartbeat_state(&self) -> HeartbeatState {
        match &self.heartbeat {
            Some(monitor) => monitor.state(),
            None => HeartbeatState::Idle,
        }
    }

    /// The heartbeat monitor, if monitoring was started.
    #[must_use]
    pub const fn heartbeat(&self) -> Option<&HeartbeatMonitor> {
        self.heartbeat.as_ref()
    }

    /// Handles one socket event.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Dispatch`] if dispatching a message fails.
    pub fn handle_event(&mut self, event: SocketEvent) -> Result<(), ConnectionError> {
        match event {
            SocketEvent::Message(frame) => {
                self.router.dispatch(&frame)?;
            }
            SocketEvent::Pong => {
                if let Some(monitor) = self.heartbeat.as_mut() {
                    monitor.on_pong();
                }
            }
            SocketEvent::Close => self.terminate_heartbeat(Termination::TransportClosed),
            SocketEvent::Error(err) => {
                warn!(error = %err, "transport error");
                self.terminate_heartbeat(Termination::TransportError);
            }
        }
        Ok(())
    }

    /// Applies a fired heartbeat timer.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Socket`] if the heartbeat ping failed.
    pub fn handle_timer(&mut self, timer: HeartbeatTimer) -> Result<(), ConnectionError> {
        if let Some(monitor) = self.heartbeat.as_mut() {
            monitor.on_timer(timer, &self.socket)?;
        }
        Ok(())
    }

    /// Drives the connection until it closes.
    ///
    /// Consumes `events` and heartbeat timers on the current task. Whatever
    /// the exit path, the heartbeat has made its terminal transition by the
    /// time this returns.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`ConnectionError`]: an unregistered command,
    /// a failing handler, a rejected malformed frame, a failed ping, or a
    /// transport error reported by `events`.
    pub async fn run<E>(mut self, mut events: E) -> Result<RunOutcome, ConnectionError>
    where
        E: Stream<Item = SocketEvent> + Unpin,
    {
        let result = self.drive(&mut events).await;
        self.terminate_heartbeat(Termination::Shutdown);
        result
    }

    async fn drive<E>(&mut self, events: &mut E) -> Result<RunOutcome, ConnectionError>
    where
        E: Stream<Item = SocketEvent> + Unpin,
    {
        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else {
                        self.terminate_heartbeat(Termination::TransportClosed);
                        return Ok(RunOutcome::Closed);
                    };
                    let transport_error = match &event {
                        SocketEvent::Error(err) => Some(err.clone()),
                        _ => None,
                    };
                    let closing = matches!(event, SocketEvent::Close);
                    self.handle_event(event)?;
                    if let Some(err) = transport_error {
                        return Err(ConnectionError::Socket(err));
                    }
                    if closing {
                        return Ok(RunOutcome::Closed);
                    }
                }
                timer = next_heartbeat_timer(&mut self.heartbeat) => {
                    self.handle_timer(timer)?;
                    if self.heartbeat.as_ref().and_then(HeartbeatMonitor::termination)
                        == Some(Termination::WatchdogExpired)
                    {
                        return Ok(RunOutcome::HeartbeatExpired);
                    }
                }
            }
        }
    }

    fn terminate_heartbeat(&mut self, reason: Termination) {
        if let Some(monitor) = self.heartbeat.as_mut() {
            monitor.terminate(reason);
        }
    }
}

async fn next_heartbeat_timer(heartbeat: &mut Option<HeartbeatMonitor>) -> HeartbeatTimer {
    match heartbeat {
        Some(monitor) => monitor.next_timer().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, SocketError};
    use crate::ws::socket::{ChannelSocket, Frame, Outbound, OutboundFrame};
    use futures_util::stream;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn make_connection() -> (Connection<ChannelSocket>, mpsc::Receiver<Outbound>) {
        let (socket, rx) = ChannelSocket::new(64);
        (Connection::new(socket), rx)
    }

    fn text(s: &str) -> SocketEvent {
        SocketEvent::Message(Frame::Text(s.to_string()))
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        (calls, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Event stream fed from a channel, ending when the sender is dropped.
    fn channel_events(
        rx: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> impl Stream<Item = SocketEvent> + Unpin {
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    #[test]
    fn handle_event_dispatches_to_handler() {
        let (mut conn, _rx) = make_connection();
        let (tx, mut seen) = mpsc::unbounded_channel();
        conn.on_command("ping", move |data| {
            tx.send(data)?;
            Ok(())
        });

        let result = conn.handle_event(text(r#"{"command":"ping","data":{"n":1}}"#));
        assert!(result.is_ok());
        assert_eq!(seen.try_recv().ok(), Some(json!({"n": 1})));
    }

    #[test]
    fn router_exists_before_any_registration() {
        let (mut conn, _rx) = make_connection();
        assert!(conn.router().is_empty());

        let result = conn.handle_event(text(r#"{"command":"ping","data":1}"#));
        assert!(matches!(
            result,
            Err(ConnectionError::Dispatch(DispatchError::UnregisteredCommand(_)))
        ));
    }

    #[tokio::test]
    async fn handler_can_reply_through_socket() {
        let (mut conn, mut rx) = make_connection();
        let socket = conn.socket().clone();
        conn.on_command("echo", move |data| {
            router::send_command(&socket, "echo", &data, SendOptions::text(), None)?;
            Ok(())
        });

        let events = stream::iter(vec![text(r#"{"command":"echo","data":[1,2]}"#)]);
        let outcome = conn.run(events).await;
        assert!(matches!(outcome, Ok(RunOutcome::Closed)));

        let Some(out) = rx.recv().await else {
            panic!("expected a reply");
        };
        let OutboundFrame::Text(reply) = out.frame else {
            panic!("expected a text reply");
        };
        assert_eq!(reply, r#"{"command":"echo","data":[1,2]}"#);
    }

    #[tokio::test]
    async fn send_helpers_forward_to_socket() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send_json(&json!({"a": 1}), SendOptions::text(), None).is_ok());
        assert!(conn.send_command("c", "d", SendOptions::text(), None).is_ok());

        let first = rx.recv().await.map(|o| o.frame);
        let second = rx.recv().await.map(|o| o.frame);
        assert_eq!(first, Some(OutboundFrame::Text(r#"{"a":1}"#.to_string())));
        assert_eq!(
            second,
            Some(OutboundFrame::Text(r#"{"command":"c","data":"d"}"#.to_string()))
        );
    }

    #[tokio::test]
    async fn malformed_and_binary_frames_do_not_stop_run() {
        let (mut conn, _rx) = make_connection();
        let (tx, mut seen) = mpsc::unbounded_channel();
        conn.on_command("x", move |data| {
            tx.send(data)?;
            Ok(())
        });

        let events = stream::iter(vec![
            text(r#"{"command":"x"}"#),
            text("not json"),
            SocketEvent::Message(Frame::Binary(br#"{"command":"x","data":1}"#.to_vec())),
            text(r#"{"command":"x","data":2}"#),
        ]);
        let outcome = conn.run(events).await;

        assert!(matches!(outcome, Ok(RunOutcome::Closed)));
        assert_eq!(seen.try_recv().ok(), Some(json!(2)));
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_command_ends_run_with_error() {
        let (conn, _rx) = make_connection();
        let events = stream::iter(vec![text(r#"{"command":"nope","data":{}}"#)]);

        let outcome = conn.run(events).await;
        assert!(matches!(
            outcome,
            Err(ConnectionError::Dispatch(DispatchError::UnregisteredCommand(ref c))) if c == "nope"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_expires_heartbeat() {
        let (mut conn, mut rx) = make_connection();
        let (calls, cb) = counter();
        conn.monitor(
            Duration::from_millis(1000),
            cb,
            Some(Duration::from_millis(500)),
        );

        let outcome = conn.run(stream::pending()).await;

        assert!(matches!(outcome, Ok(RunOutcome::HeartbeatExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let pings = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|o| matches!(o.frame, OutboundFrame::Ping { .. }))
            .count();
        assert_eq!(pings, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn answering_peer_keeps_heartbeat_alive() {
        let (mut conn, mut outbound) = make_connection();
        let (calls, cb) = counter();
        conn.monitor(Duration::from_millis(1000), cb, None);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peer = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(out) = outbound.recv().await {
                if matches!(out.frame, OutboundFrame::Ping { .. }) {
                    pings += 1;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let _ = event_tx.send(SocketEvent::Pong);
                    if pings == 10 {
                        let _ = event_tx.send(SocketEvent::Close);
                    }
                }
            }
            pings
        });

        let outcome = conn.run(channel_events(event_rx)).await;
        assert!(matches!(outcome, Ok(RunOutcome::Closed)));

        let Ok(pings) = peer.await else {
            panic!("peer task failed");
        };
        assert_eq!(pings, 10);
        // The close itself is the single terminal signal.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_then_error_then_pong_fire_callback_once() {
        let (mut conn, _rx) = make_connection();
        let (calls, cb) = counter();
        conn.monitor(Duration::from_millis(100), cb, None);
        assert_eq!(conn.heartbeat_state(), HeartbeatState::Armed);

        let timer = next_heartbeat_timer(&mut conn.heartbeat).await;
        assert!(conn.handle_timer(timer).is_ok());
        assert_eq!(conn.heartbeat_state(), HeartbeatState::AwaitingPong);

        assert!(conn.handle_event(SocketEvent::Close).is_ok());
        assert!(
            conn.handle_event(SocketEvent::Error(SocketError::Transport("reset".into())))
                .is_ok()
        );
        assert!(conn.handle_event(SocketEvent::Pong).is_ok());
        assert!(conn.handle_timer(HeartbeatTimer::Watchdog).is_ok());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.heartbeat_state(), HeartbeatState::Closed);
        assert_eq!(
            conn.heartbeat().and_then(HeartbeatMonitor::termination),
            Some(Termination::TransportClosed)
        );
    }

    #[tokio::test]
    async fn fatal_error_still_closes_heartbeat() {
        let (mut conn, _rx) = make_connection();
        let (calls, cb) = counter();
        conn.monitor(Duration::from_secs(30), cb, None);

        let events = stream::iter(vec![text(r#"{"command":"missing","data":1}"#)]);
        let outcome = conn.run(events).await;

        assert!(outcome.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_without_monitor_ends_on_stream_end() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.heartbeat_state(), HeartbeatState::Idle);
        let outcome = conn.run(stream::empty()).await;
        assert!(matches!(outcome, Ok(RunOutcome::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn ping_failure_ends_run_with_socket_error() {
        let (mut conn, rx) = make_connection();
        drop(rx);
        let (calls, cb) = counter();
        conn.monitor(Duration::from_millis(10), cb, None);

        let outcome = conn.run(stream::pending()).await;
        assert!(matches!(
            outcome,
            Err(ConnectionError::Socket(SocketError::Closed))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remonitor_closes_previous_monitor() {
        let (mut conn, _rx) = make_connection();
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        conn.monitor(Duration::from_secs(1), cb1, None);
        conn.monitor(Duration::from_secs(2), cb2, None);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(conn.heartbeat_state(), HeartbeatState::Armed);
        assert_eq!(
            conn.heartbeat().map(HeartbeatMonitor::interval),
            Some(Duration::from_secs(2))
        );

        let outcome = conn.run(stream::empty()).await;
        assert!(matches!(outcome, Ok(RunOutcome::Closed)));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_error_ends_run() {
        let (mut conn, _rx) = make_connection();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        conn.on_command("x", move |data| {
            seen_tx.send(data)?;
            Ok(())
        });
        let (calls, cb) = counter();
        conn.monitor(Duration::from_secs(30), cb, None);

        let events = stream::iter(vec![
            SocketEvent::Error(SocketError::Transport("reset".into())),
            text(r#"{"command":"x","data":1}"#),
        ]);
        let outcome = conn.run(events).await;

        assert!(matches!(
            outcome,
            Err(ConnectionError::Socket(SocketError::Transport(ref m))) if m == "reset"
        ));
        assert!(seen.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
