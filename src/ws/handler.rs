//! Axum WebSocket upgrade handler and transport adapter.
//!
//! Bridges an axum [`WebSocket`] to the transport-agnostic [`Connection`]:
//! inbound messages become [`SocketEvent`]s, and a writer task drains the
//! connection's [`ChannelSocket`] queue into the socket sink.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{Instrument, debug, info, info_span, warn};

use super::commands::register_builtin;
use super::connection::{Connection, RunOutcome};
use super::socket::{ChannelSocket, Frame, Outbound, OutboundFrame, SocketEvent};
use crate::app_state::AppState;
use crate::error::{CLOSE_GOING_AWAY, SocketError};

/// How long to wait for the peer to answer a server-initiated close.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /ws` — Upgrade HTTP connection to WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

/// Runs the extension layer on one upgraded socket until it closes.
pub async fn serve_socket(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4();
    let span = info_span!("ws", %conn_id);
    async move {
        let _guard = state.track_connection();
        let config = &state.config;
        let (ws_tx, ws_rx) = socket.split();
        let (channel, outbound_rx) = ChannelSocket::new(config.send_buffer_capacity);
        let writer = tokio::spawn(write_loop(outbound_rx, ws_tx).in_current_span());

        let mut connection =
            Connection::with_policy(channel.clone(), config.malformed_frame_policy);
        register_builtin(&mut connection);
        if config.heartbeat_enabled {
            connection.monitor(
                config.heartbeat_interval,
                || warn!("peer stopped answering heartbeat"),
                config.heartbeat_timeout,
            );
        }
        info!(
            active = state.active_connections(),
            heartbeat = config.heartbeat_enabled,
            "ws connection opened"
        );

        let mut events = ws_rx.filter_map(|msg| future::ready(to_event(msg)));
        let closed_by_us = match connection.run(&mut events).await {
            Ok(RunOutcome::Closed) => {
                debug!("peer closed connection");
                false
            }
            Ok(RunOutcome::HeartbeatExpired) => {
                channel.close(CLOSE_GOING_AWAY, "heartbeat timeout").is_ok()
            }
            Err(err) => {
                warn!(error = %err, "closing connection");
                channel.close(err.close_code(), err.to_string()).is_ok()
            }
        };

        drop(channel);
        if writer.await.is_err() {
            warn!("ws writer task panicked");
        }
        if closed_by_us {
            await_peer_close(&mut events, CLOSE_HANDSHAKE_TIMEOUT).await;
        }
        info!("ws connection closed");
    }
    .instrument(span)
    .await;
}

/// Reads the peer's remaining frames until it answers our close frame.
///
/// Dropping the socket with unread input resets the TCP stream, which can
/// discard the close frame before the peer reads it.
async fn await_peer_close<E>(events: &mut E, limit: Duration)
where
    E: Stream<Item = SocketEvent> + Unpin,
{
    let drain = async {
        while let Some(event) = events.next().await {
            if matches!(event, SocketEvent::Close | SocketEvent::Error(_)) {
                return;
            }
        }
    };
    if time::timeout(limit, drain).await.is_err() {
        debug!("peer did not answer close frame");
    }
}

/// Maps an inbound axum message to a socket event.
///
/// Pings are answered by axum itself and produce no event.
fn to_event(msg: Result<Message, axum::Error>) -> Option<SocketEvent> {
    match msg {
        Ok(Message::Text(text)) => {
            Some(SocketEvent::Message(Frame::Text(text.as_str().to_owned())))
        }
        Ok(Message::Binary(bytes)) => Some(SocketEvent::Message(Frame::Binary(bytes.to_vec()))),
        Ok(Message::Pong(_)) => Some(SocketEvent::Pong),
        Ok(Message::Close(_)) => Some(SocketEvent::Close),
        Ok(Message::Ping(_)) => None,
        Err(err) => Some(SocketEvent::Error(SocketError::Transport(err.to_string()))),
    }
}

/// Maps a queued frame to an axum message. Servers never mask, so the ping
/// mask flag is dropped here.
fn to_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::text(text),
        OutboundFrame::Binary(bytes) => Message::binary(bytes),
        OutboundFrame::Ping { payload, .. } => Message::Ping(payload.into()),
        OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

/// Drains queued frames into `sink`, reporting each write to its sender.
///
/// Stops after a close frame, on the first write failure, or once every
/// [`ChannelSocket`] handle is dropped.
async fn write_loop<Si>(mut rx: mpsc::Receiver<Outbound>, mut sink: Si)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(outbound) = rx.recv().await {
        let (frame, completion) = outbound.into_parts();
        let closing = matches!(frame, OutboundFrame::Close { .. });

        let result = sink
            .send(to_message(frame))
            .await
            .map_err(|err| SocketError::Transport(err.to_string()));
        let failed = result.is_err();
        if let Err(err) = &result {
            debug!(error = %err, "ws write failed");
        }
        completion.complete(result);

        if failed || closing {
            break;
        }
    }
    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        outbound.complete(Err(SocketError::Closed));
    }
}
