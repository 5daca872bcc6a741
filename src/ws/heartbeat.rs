//! Heartbeat ping/pong liveness monitoring.
//!
//! A [`HeartbeatMonitor`] pings the peer every `interval` and keeps at most
//! one watchdog pending. The watchdog is armed by the first unanswered ping
//! and cleared by any pong; ping emission and watchdog are independent, so
//! several pings may go out while one watchdog is pending. If the watchdog
//! fires, or the transport closes or errors, the monitor closes and invokes
//! its timeout callback. That happens at most once per monitor.
//!
//! The monitor holds no task of its own. The owning connection task awaits
//! [`HeartbeatMonitor::next_timer`] alongside its socket events and feeds the
//! result back through [`HeartbeatMonitor::on_timer`], so timer firings and
//! transport events never run concurrently.

use std::fmt;
use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, warn};

use super::socket::Socket;
use crate::error::SocketError;

/// Smallest interval or timeout the monitor accepts.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Callback invoked once when the heartbeat closes.
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// Heartbeat lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// No monitor is attached.
    Idle,
    /// Pings are scheduled and no watchdog is pending.
    Armed,
    /// A ping went unanswered and the watchdog is pending.
    AwaitingPong,
    /// Terminal. No further pings or callbacks.
    Closed,
}

/// Why the heartbeat closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No pong arrived within the ping timeout.
    WatchdogExpired,
    /// The transport reported a close.
    TransportClosed,
    /// The transport reported an error.
    TransportError,
    /// Sending a ping failed.
    PingFailed,
    /// A newer monitor took over the connection.
    Replaced,
    /// The owning connection stopped for another reason.
    Shutdown,
}

/// Timer that fired for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTimer {
    /// The periodic ping schedule ticked.
    Tick,
    /// The watchdog expired.
    Watchdog,
}

/// Per-connection heartbeat state machine.
pub struct HeartbeatMonitor {
    interval: Duration,
    ping_timeout: Duration,
    ticker: Interval,
    watchdog: Option<Pin<Box<Sleep>>>,
    on_timeout: Option<TimeoutCallback>,
    termination: Option<Termination>,
    pings_sent: u64,
}

impl HeartbeatMonitor {
    /// Starts monitoring.
    ///
    /// The first ping goes out one `interval` from now. `ping_timeout`
    /// defaults to `interval`. Both are raised to [`MIN_PERIOD`] if smaller.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<F>(interval: Duration, on_timeout: F, ping_timeout: Option<Duration>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let interval = interval.max(MIN_PERIOD);
        let ping_timeout = ping_timeout.unwrap_or(interval).max(MIN_PERIOD);

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            interval,
            ping_timeout,
            ticker,
            watchdog: None,
            on_timeout: Some(Box::new(on_timeout)),
            termination: None,
            pings_sent: 0,
        }
    }

    /// Ping period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Time allowed for a pong after the oldest unanswered ping.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HeartbeatState {
        if self.termination.is_some() {
            HeartbeatState::Closed
        } else if self.watchdog.is_some() {
            HeartbeatState::AwaitingPong
        } else {
            HeartbeatState::Armed
        }
    }

    /// Why the monitor closed, once it has.
    #[must_use]
    pub const fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Returns `true` once the terminal transition has happened.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.termination.is_some()
    }

    /// Number of pings emitted so far.
    #[must_use]
    pub const fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Waits for the next timer to fire.
    ///
    /// Never completes once the monitor is closed. When the watchdog and a
    /// tick are due together, the watchdog wins. Cancel-safe.
    pub async fn next_timer(&mut self) -> HeartbeatTimer {
        if self.is_closed() {
            return future::pending().await;
        }

        let Self {
            ticker, watchdog, ..
        } = self;
        let expiry = async {
            match watchdog.as_mut() {
                Some(sleep) => sleep.as_mut().await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = expiry => HeartbeatTimer::Watchdog,
            _ = ticker.tick() => HeartbeatTimer::Tick,
        }
    }

    /// Applies a fired timer.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the ping could not be sent. The monitor
    /// has already closed with [`Termination::PingFailed`] in that case.
    pub fn on_timer<S>(&mut self, timer: HeartbeatTimer, socket: &S) -> Result<(), SocketError>
    where
        S: Socket + ?Sized,
    {
        match timer {
            HeartbeatTimer::Tick => self.on_tick(socket),
            HeartbeatTimer::Watchdog => {
                self.terminate(Termination::WatchdogExpired);
                Ok(())
            }
        }
    }

    /// Emits a ping and arms the watchdog if none is pending.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the ping could not be sent.
    pub fn on_tick<S>(&mut self, socket: &S) -> Result<(), SocketError>
    where
        S: Socket + ?Sized,
    {
        if self.is_closed() {
            return Ok(());
        }

        if let Err(err) = socket.ping(Vec::new(), true) {
            warn!(error = %err, "heartbeat ping failed");
            self.terminate(Termination::PingFailed);
            return Err(err);
        }
        self.pings_sent += 1;

        if self.watchdog.is_none() {
            self.watchdog = Some(Box::pin(time::sleep(self.ping_timeout)));
        }
        Ok(())
    }

    /// Clears the pending watchdog. The ping schedule is left untouched.
    pub fn on_pong(&mut self) {
        if self.is_closed() {
            return;
        }
        self.watchdog = None;
    }

    /// Performs the terminal transition and invokes the timeout callback.
    ///
    /// Returns `false` (and does nothing) if the monitor was already closed.
    pub fn terminate(&mut self, reason: Termination) -> bool {
        if self.is_closed() {
            return false;
        }
        self.termination = Some(reason);
        self.watchdog = None;
        debug!(?reason, pings = self.pings_sent, "heartbeat closed");

        if let Some(on_timeout) = self.on_timeout.take() {
            on_timeout();
        }
        true
    }
}

impl fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("interval", &self.interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("state", &self.state())
            .field("termination", &self.termination)
            .field("pings_sent", &self.pings_sent)
            .finish_non_exhaustive()
    }
}
