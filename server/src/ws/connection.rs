//! Per-connection actor.
//!
//! Each authenticated WebSocket is split into a reader task and a writer task:
//! - Reader: receives frames, decodes the type tag, spawns the matching handler
//! - Writer: owns the sink, drains the bounded outbound queue, sends keepalive
//!   pings and the final close frame
//!
//! Anything that wants to reach the client goes through [`Connection::enqueue`]
//! (or [`Connection::send`]), which never waits: a full queue disconnects the
//! client. `close` may be called from any task any number of times; only the
//! first call deregisters the connection and stops the tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};

use crate::hub::Hub;
use crate::lifecycle::{TaskGuard, TrackerError};
use crate::ws::protocol::{decode_type_tag, Envelope, ErrorEnvelope, ErrorKind};

/// Close codes sent to clients.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_POLICY: u16 = 1008;
/// A newer connection for the same user took over.
pub const CLOSE_REPLACED: u16 = 4000;

/// Upper bound on a single frame write before the client is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful close keeps draining queued frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Overflow,
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Closed flag set, writer still releasing the transport.
    Closing,
    Closed,
}

#[derive(Debug)]
enum ControlEvent {
    Quit {
        code: u16,
        reason: &'static str,
        flush: bool,
    },
}

pub struct Connection {
    id: u64,
    user: UserIdentity,
    hub: Hub,
    closed: AtomicBool,
    transport_released: AtomicBool,
    outbound_tx: mpsc::Sender<Message>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    closed_signal: watch::Sender<bool>,
    opened_at: Instant,
    /// Millis after `opened_at` of the last inbound frame.
    last_seen: AtomicU64,
    dispatch_seq: AtomicU64,
}

/// Receiving halves handed to the connection's two tasks.
pub struct ConnectionTasks {
    outbound_rx: mpsc::Receiver<Message>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
}

impl Connection {
    pub(crate) fn new(hub: Hub, id: u64, user: UserIdentity) -> (Arc<Self>, ConnectionTasks) {
        let capacity = hub.settings().outbound_queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (closed_signal, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id,
            user,
            hub,
            closed: AtomicBool::new(false),
            transport_released: AtomicBool::new(false),
            outbound_tx,
            control_tx,
            closed_signal,
            opened_at: Instant::now(),
            last_seen: AtomicU64::new(0),
            dispatch_seq: AtomicU64::new(0),
        });

        (
            conn,
            ConnectionTasks {
                outbound_rx,
                control_rx,
            },
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if !self.is_closed() {
            ConnectionState::Open
        } else if !self.transport_released.load(Ordering::Acquire) {
            ConnectionState::Closing
        } else {
            ConnectionState::Closed
        }
    }

    /// Queue a frame for the writer without waiting.
    ///
    /// A full queue closes the connection with [`CLOSE_POLICY`].
    pub fn enqueue(&self, msg: Message) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.outbound_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = self.id,
                    user_id = %self.user.id,
                    "Outbound queue full, disconnecting slow client"
                );
                self.close_with(CLOSE_POLICY, "outbound queue overflow", false);
                Err(SendError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(SendError::Closed)
            }
        }
    }

    /// Encode an envelope and queue it for this client.
    pub fn send<E: Envelope>(&self, envelope: &E) -> Result<(), SendError> {
        let msg = envelope.to_message()?;
        self.enqueue(msg)
    }

    /// Close with a normal close code. Returns true only for the call that
    /// actually closed the connection.
    pub fn close(&self) -> bool {
        self.close_with(CLOSE_NORMAL, "", false)
    }

    /// Close with an explicit code. When `flush` is set the writer sends what
    /// is already queued before the close frame.
    pub fn close_with(&self, code: u16, reason: &'static str, flush: bool) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Only remove the entry if it is still ours, a replacement may own it
        let removed = self
            .hub
            .connections()
            .remove_if(&self.user.id, |_, current| current.id == self.id)
            .is_some();

        self.closed_signal.send_replace(true);
        let _ = self
            .control_tx
            .send(ControlEvent::Quit { code, reason, flush });

        tracing::info!(
            connection_id = self.id,
            user_id = %self.user.id,
            code,
            deregistered = removed,
            "Connection closed"
        );
        true
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen.load(Ordering::Relaxed));
        self.opened_at.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.opened_at.elapsed().as_millis() as u64;
        self.last_seen.store(now, Ordering::Relaxed);
    }

    /// Route one inbound frame. Returns false when the reader must stop.
    fn dispatch(self: &Arc<Self>, raw: Bytes) -> bool {
        let tag = match decode_type_tag(&raw) {
            Ok(tag) => tag,
            Err(e) => {
                tracing::warn!(
                    connection_id = self.id,
                    user_id = %self.user.id,
                    error = %e,
                    "Malformed envelope, closing connection"
                );
                let _ = self.send(&ErrorEnvelope::new(ErrorKind::BadFormat, "Malformed JSON"));
                self.close_with(CLOSE_INVALID_PAYLOAD, "malformed envelope", true);
                return false;
            }
        };

        let Some(handler) = self.hub.dispatch().lookup(&tag.kind) else {
            tracing::debug!(
                connection_id = self.id,
                kind = %tag.kind,
                "No handler for message type, ignoring"
            );
            return true;
        };

        let seq = self.dispatch_seq.fetch_add(1, Ordering::Relaxed);
        let guard = match self
            .hub
            .tracker()
            .track(format!("dispatch::{}::{}", self.id, seq))
        {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!(
                    connection_id = self.id,
                    error = %e,
                    "Failed to track handler task"
                );
                return true;
            }
        };

        // Fire-and-forget: handlers for one connection may finish out of order
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            (handler.as_ref())(raw, conn).await;
        });
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionTasks {
    /// Start the reader and writer for `conn` on `socket`.
    pub fn spawn(self, conn: &Arc<Connection>, socket: WebSocket) -> Result<(), TrackerError> {
        let tracker = conn.hub.tracker();
        let read_guard = tracker.track(format!("connection_read::{}", conn.id))?;
        let write_guard = tracker.track(format!("connection_write::{}", conn.id))?;

        let (sink, stream) = socket.split();
        tokio::spawn(write_loop(
            Arc::clone(conn),
            sink,
            self.outbound_rx,
            self.control_rx,
            write_guard,
        ));
        tokio::spawn(read_loop(Arc::clone(conn), stream, read_guard));

        tracing::debug!(
            connection_id = conn.id,
            user_id = %conn.user.id,
            "Connection tasks started"
        );
        Ok(())
    }
}

async fn read_loop(conn: Arc<Connection>, mut stream: SplitStream<WebSocket>, _guard: TaskGuard) {
    let mut closed = conn.closed_signal.subscribe();

    loop {
        let frame = tokio::select! {
            biased;
            _ = async {
                let _ = closed.wait_for(|closed| *closed).await;
            } => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                conn.touch();
                if !conn.dispatch(Bytes::copy_from_slice(text.as_str().as_bytes())) {
                    break;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                conn.touch();
                if !conn.dispatch(data) {
                    break;
                }
            }
            // The WebSocket layer answers pings itself
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => conn.touch(),
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(
                    connection_id = conn.id,
                    reason = ?frame,
                    "Client initiated close"
                );
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(
                    connection_id = conn.id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => break,
        }
    }

    conn.close();
    tracing::debug!(connection_id = conn.id, "Reader stopped");
}

async fn write_loop(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    _guard: TaskGuard,
) {
    let settings = conn.hub.settings();
    let idle_timeout = settings.idle_timeout;
    let mut keepalive = settings.ping_interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            biased;
            event = control_rx.recv() => {
                let Some(ControlEvent::Quit { code, reason, flush }) = event else {
                    break;
                };
                if flush {
                    flush_outbound(&mut sink, &mut outbound_rx).await;
                }
                let frame = Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                }));
                let _ = timeout(WRITE_TIMEOUT, sink.send(frame)).await;
                break;
            }
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                if !write_frame(&conn, &mut sink, msg).await {
                    break;
                }
            }
            _ = next_tick(&mut keepalive) => {
                if conn.idle_for() > idle_timeout {
                    tracing::info!(connection_id = conn.id, "Idle timeout");
                    // The quit event is picked up on the next iteration
                    conn.close_with(CLOSE_POLICY, "idle timeout", false);
                    continue;
                }
                if !write_frame(&conn, &mut sink, Message::Ping(Bytes::new())).await {
                    break;
                }
            }
        }
    }

    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
    conn.transport_released.store(true, Ordering::Release);
    tracing::debug!(connection_id = conn.id, "Writer stopped");
}

/// Send one frame. On failure the connection is closed and false returned.
async fn write_frame(
    conn: &Connection,
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
) -> bool {
    match timeout(WRITE_TIMEOUT, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(connection_id = conn.id, error = %e, "WebSocket send failed");
            conn.close();
            false
        }
        Err(_) => {
            tracing::warn!(connection_id = conn.id, "WebSocket send timed out");
            conn.close_with(CLOSE_POLICY, "write timeout", false);
            false
        }
    }
}

/// Send whatever is already queued, bounded by [`FLUSH_TIMEOUT`].
async fn flush_outbound(
    sink: &mut SplitSink<WebSocket, Message>,
    outbound_rx: &mut mpsc::Receiver<Message>,
) {
    let drain = async {
        while let Ok(msg) = outbound_rx.try_recv() {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    };
    let _ = timeout(FLUSH_TIMEOUT, drain).await;
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
