//! The hub: owns the ticket store, the connection registry, the dispatch table
//! and the broadcast queue, and coordinates shutdown.
//!
//! Background tasks started here register with the [`LifecycleTracker`]:
//! - `hub_run`: waits for the shutdown signal, then sweeps every connection
//! - `broadcast_loop`: fans the broadcast queue out to all connections
//! - `ticket_sweeper`: drops expired tickets

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use tokio::sync::{mpsc, oneshot, watch};

use crate::auth::ticket::TicketStore;
use crate::chat;
use crate::config::HubConfig;
use crate::db::SharedStore;
use crate::error::HubError;
use crate::lifecycle::{LifecycleTracker, TaskGuard, TrackerError};
use crate::ws::broadcast::run_broadcast_loop;
use crate::ws::connection::{Connection, UserIdentity, CLOSE_GOING_AWAY, CLOSE_REPLACED};
use crate::ws::dispatch::DispatchRegistry;
use crate::ws::protocol::Envelope;
use crate::ws::{new_connection_registry, snapshot, ConnectionRegistry};

/// Runtime values derived from [`HubConfig`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub ticket_ttl: Duration,
    pub ticket_sweep_interval: Duration,
    pub handshake_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub broadcast_queue_capacity: usize,
    /// None disables keepalive pings and with them idle detection.
    pub ping_interval: Option<Duration>,
    pub idle_timeout: Duration,
    pub history_limit: usize,
    pub kdf_iterations: u32,
    /// 0 disables rate limiting on the handshake endpoints.
    pub auth_rate_burst: u32,
    pub auth_rate_period: Duration,
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            ticket_ttl: Duration::from_millis(config.ticket_ttl_ms),
            ticket_sweep_interval: Duration::from_millis(config.ticket_sweep_interval_ms.max(1)),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            outbound_queue_capacity: config.outbound_queue_capacity,
            broadcast_queue_capacity: config.broadcast_queue_capacity,
            ping_interval: (config.ping_interval_secs > 0)
                .then(|| Duration::from_secs(config.ping_interval_secs)),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            history_limit: config.history_limit,
            kdf_iterations: config.kdf_iterations,
            auth_rate_burst: config.auth_rate_burst,
            auth_rate_period: Duration::from_secs(config.auth_rate_period_secs.max(1)),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

struct HubInner {
    settings: HubSettings,
    store: SharedStore,
    tickets: Arc<TicketStore>,
    connections: ConnectionRegistry,
    dispatch: DispatchRegistry,
    broadcast_tx: mpsc::Sender<Message>,
    tracker: Arc<LifecycleTracker>,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
    next_connection_id: AtomicU64,
}

/// Cheap-to-clone handle to the running hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Collects handlers before the hub starts; the dispatch table is frozen by
/// [`HubBuilder::start`].
pub struct HubBuilder {
    settings: HubSettings,
    store: SharedStore,
    tracker: Arc<LifecycleTracker>,
    dispatch: DispatchRegistry,
}

impl HubBuilder {
    pub fn new(settings: HubSettings, store: SharedStore, tracker: Arc<LifecycleTracker>) -> Self {
        Self {
            settings,
            store,
            tracker,
            dispatch: DispatchRegistry::new(),
        }
    }

    pub fn register_handler<F, Fut>(&mut self, tag: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Bytes, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dispatch.register(tag, handler);
        self
    }

    /// Register the chat, identity and room handlers.
    pub fn with_default_handlers(mut self) -> Self {
        chat::register_handlers(&mut self);
        self
    }

    /// Start the coordinator, broadcast loop and ticket sweeper.
    pub fn start(self) -> Result<Hub, TrackerError> {
        let run_guard = self.tracker.track("hub_run")?;
        let broadcast_guard = self.tracker.track("broadcast_loop")?;
        let sweeper_guard = self.tracker.track("ticket_sweeper")?;

        let (broadcast_tx, broadcast_rx) =
            mpsc::channel(self.settings.broadcast_queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(handlers = ?self.dispatch.tags(), "Hub starting");

        let hub = Hub {
            inner: Arc::new(HubInner {
                tickets: Arc::new(TicketStore::new(self.settings.ticket_ttl)),
                settings: self.settings,
                store: self.store,
                connections: new_connection_registry(),
                dispatch: self.dispatch,
                broadcast_tx,
                tracker: self.tracker,
                shutdown_tx,
                shutting_down: AtomicBool::new(false),
                next_connection_id: AtomicU64::new(1),
            }),
        };

        tokio::spawn(run(
            hub.clone(),
            broadcast_rx,
            run_guard,
            broadcast_guard,
            sweeper_guard,
        ));
        Ok(hub)
    }
}

impl Hub {
    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.inner.tickets
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.inner.tracker
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.connections
    }

    pub fn dispatch(&self) -> &DispatchRegistry {
        &self.inner.dispatch
    }

    pub fn connection(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .get(user_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Register a freshly upgraded socket and start its tasks.
    ///
    /// An existing connection for the same user is closed as replaced. A
    /// connection admitted after shutdown began closes itself immediately so
    /// the shutdown sweep cannot miss it.
    pub fn accept(&self, socket: WebSocket, user: UserIdentity) -> Arc<Connection> {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let user_id = user.id.clone();
        let (conn, tasks) = Connection::new(self.clone(), id, user);

        if let Some(previous) = self.inner.connections.insert(user_id.clone(), Arc::clone(&conn)) {
            tracing::info!(
                user_id = %user_id,
                previous = previous.id(),
                connection_id = id,
                "Replacing existing connection"
            );
            previous.close_with(CLOSE_REPLACED, "replaced by a newer connection", true);
        }

        if self.is_shutting_down() {
            conn.close_with(CLOSE_GOING_AWAY, "server shutting down", false);
        }

        if let Err(e) = tasks.spawn(&conn, socket) {
            tracing::error!(connection_id = id, error = %e, "Failed to start connection tasks");
            conn.close();
            return conn;
        }

        tracing::info!(
            connection_id = id,
            user_id = %user_id,
            connections = self.connection_count(),
            "Connection accepted"
        );
        conn
    }

    /// Queue an envelope for every live connection. Waits for room in the
    /// broadcast queue; fails once the broadcast loop has stopped.
    pub async fn broadcast<E: Envelope>(&self, envelope: &E) -> Result<(), HubError> {
        let msg = envelope
            .to_message()
            .map_err(|e| HubError::ProtocolError(e.to_string()))?;
        self.inner
            .broadcast_tx
            .send(msg)
            .await
            .map_err(|_| HubError::ShuttingDown)
    }

    /// Begin shutdown. Safe to call any number of times from any task.
    pub fn shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested");
        }
        self.inner.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        // The sender lives in HubInner, which outlives this borrow
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.connection_count())
            .field("shutting_down", &self.is_shutting_down())
            .field("dispatch", &self.inner.dispatch)
            .finish()
    }
}

/// Shutdown coordinator.
async fn run(
    hub: Hub,
    broadcast_rx: mpsc::Receiver<Message>,
    _guard: TaskGuard,
    broadcast_guard: TaskGuard,
    sweeper_guard: TaskGuard,
) {
    let (stop_tx, stop_rx) = oneshot::channel();
    let broadcast = tokio::spawn(run_broadcast_loop(
        hub.connections().clone(),
        broadcast_rx,
        stop_rx,
        broadcast_guard,
    ));
    let sweeper = tokio::spawn(run_ticket_sweeper(
        Arc::clone(&hub.inner.tickets),
        hub.settings().ticket_sweep_interval,
        hub.inner.shutdown_tx.subscribe(),
        sweeper_guard,
    ));

    hub.wait_for_shutdown().await;

    // Untracked close: the connections' own tasks report to the tracker
    let open = snapshot(hub.connections());
    let swept = open.len();
    for conn in open {
        conn.close_with(CLOSE_GOING_AWAY, "server shutting down", true);
    }

    let _ = stop_tx.send(());
    if let Err(e) = broadcast.await {
        tracing::error!(error = %e, "Broadcast loop task join error");
    }
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Ticket sweeper task join error");
    }

    tracing::info!(swept, "Hub stopped");
}

/// Periodically drop expired tickets until shutdown.
async fn run_ticket_sweeper(
    tickets: Arc<TicketStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    _guard: TaskGuard,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = async {
                let _ = shutdown.wait_for(|stopping| *stopping).await;
            } => break,
            _ = ticker.tick() => {
                let purged = tickets.sweep_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Expired tickets purged");
                }
            }
        }
    }
}
