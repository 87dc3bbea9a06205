// Broker connection lifecycle.
//
// The transport pushes connect/disconnect/message events into one channel
// and a single event-loop task consumes them, so every state transition and
// every reconnect decision is made by one consumer. The loop owns the
// `ConnectionState`; everyone else sees it through a watch channel.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::{IngestError, TransportError};
use crate::metrics::IngestMetrics;
use crate::router::{InboundMessage, TopicFilters, TopicRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"*******")
            .finish()
    }
}

/// Everything the transport needs to open a session. The manager stores it
/// and hands the same value to every connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub clean_session: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected { session_present: bool },
    /// Only emitted for a link that had been acknowledged.
    Disconnected { was_connected: bool, reason: String },
    MessageReceived(InboundMessage),
}

/// Broker client seam. Implementations report link changes and inbound
/// messages through the event channel handed to `ConnectionManager::new`.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a session and wait for the broker to acknowledge it.
    async fn connect(&self, options: &ConnectionOptions) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// One reconnect attempt per unexpected disconnect, after `delay`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }
}

struct Shared {
    transport: Arc<dyn BrokerTransport>,
    options: ConnectionOptions,
    filters: TopicFilters,
    router: TopicRouter,
    policy: ReconnectPolicy,
    reconnect_attached: AtomicBool,
    state: watch::Sender<ConnectionState>,
    metrics: IngestMetrics,
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    events: Option<mpsc::Receiver<TransportEvent>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        events: mpsc::Receiver<TransportEvent>,
        options: ConnectionOptions,
        filters: TopicFilters,
        router: TopicRouter,
        policy: ReconnectPolicy,
        metrics: IngestMetrics,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                options,
                filters,
                router,
                policy,
                reconnect_attached: AtomicBool::new(true),
                state,
                metrics,
            }),
            events: Some(events),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Spawn the event loop, which makes the initial connect attempt and then
    /// processes transport events until `cancel` fires. Returns immediately.
    pub fn start(&mut self, cancel: CancellationToken) -> Result<JoinHandle<()>, IngestError> {
        let events = self.events.take().ok_or(IngestError::AlreadyStarted)?;
        let shared = Arc::clone(&self.shared);
        let span = info_span!(
            "mqtt_connection",
            host = %shared.options.host,
            port = shared.options.port,
            client_id = %shared.options.client_id,
        );
        Ok(tokio::spawn(run_event_loop(shared, events, cancel).instrument(span)))
    }

    /// Detach reconnect behaviour, then disconnect. Returns once the
    /// transport finishes disconnecting, fails, or `cancel` fires.
    pub async fn stop(&self, cancel: CancellationToken) -> Result<(), TransportError> {
        self.shared.reconnect_attached.store(false, Ordering::SeqCst);

        let result = tokio::select! {
            res = self.shared.transport.disconnect() => res,
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        };
        match &result {
            Ok(()) => info!("disconnected from broker"),
            Err(e) => error!(error = %e, "disconnect failed"),
        }
        result
    }
}

async fn run_event_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>, cancel: CancellationToken) {
    match shared.connect(&cancel).await {
        Ok(()) => info!("connect request acknowledged"),
        Err(e) => error!(error = %e, "connecting failed"),
    }

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => shared.handle(event, &cancel).await,
                None => {
                    debug!("transport event channel closed");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }

    info!("connection event loop stopped");
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "connection state changed");
        }
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            res = self.transport.connect(&self.options) => res,
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        };
        if result.is_err() {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    async fn handle(&self, event: TransportEvent, cancel: &CancellationToken) {
        match event {
            TransportEvent::Connected { session_present } => self.on_connected(session_present).await,
            TransportEvent::Disconnected { was_connected, reason } => {
                self.on_disconnected(was_connected, &reason, cancel).await
            }
            TransportEvent::MessageReceived(message) => {
                self.router.route(&message);
            }
        }
    }

    async fn on_connected(&self, session_present: bool) {
        self.set_state(ConnectionState::Connected);
        info!(session_present, "connected to broker");

        for filter in self.filters.subscriptions() {
            match self.transport.subscribe(&filter).await {
                Ok(()) => info!(topic = %filter, "subscribed"),
                Err(e) => error!(topic = %filter, error = %e, "subscribe failed"),
            }
        }
    }

    async fn on_disconnected(&self, was_connected: bool, reason: &str, cancel: &CancellationToken) {
        self.set_state(ConnectionState::Disconnected);
        info!(was_connected, reason = %reason, "disconnected from broker");

        if !self.reconnect_attached.load(Ordering::SeqCst) {
            debug!("reconnect detached, staying disconnected");
            return;
        }

        if !self.policy.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
            // stop() may have run while we were waiting
            if !self.reconnect_attached.load(Ordering::SeqCst) {
                return;
            }
        }

        self.metrics.reconnect_attempts.inc();
        match self.connect(cancel).await {
            Ok(()) => info!("reconnected"),
            Err(e) => error!(error = %e, "reconnect attempt failed"),
        }
    }
}
