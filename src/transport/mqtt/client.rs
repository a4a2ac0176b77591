//! Impure I/O operations for the MQTT client
//!
//! A connected client runs two background tasks per session generation:
//!
//! - the **supervisor** creates a fresh `AsyncClient`/`EventLoop` pair for
//!   every attempt, consults the [`ReconnectPolicy`] after each failure and
//!   sleeps out the backoff delay. It stops as soon as the shutdown signal
//!   fires.
//! - the **I/O task** polls the event loop (read, keepalive, outgoing
//!   requests), confirms ConnAck, replays subscriptions and dispatches
//!   inbound messages to the registry.
//!
//! All state transitions and the live `AsyncClient` are guarded by one
//! session mutex. Every background transition is tagged with the session
//! generation it was started for, so a task that outlives `disconnect()`
//! can never overwrite the caller's state.

use super::connection::{
    configure_mqtt_options, ConnackCode, ConnectionConfig, ConnectionState, ErrorCode, StateCell,
    REQUEST_CHANNEL_CAPACITY,
};
use super::dispatch::{validate_topic_name, SubscriptionId, TopicRegistry};
use super::health_monitor::{ConnectionStats, HealthMonitor, StatsSnapshot};
use super::message_handler::{
    guard_callback, ConnectionObserver, DisconnectReason, EventRoute, InboundMessage,
    MessageHandler, SubscriptionHandler,
};
use super::reconnect::{ReconnectPolicy, ReconnectionDecision};
use crate::config::ConfigError;
use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Publish, QoS, SubscribeFilter};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `disconnect()` waits for the supervisor before aborting it
const SUPERVISOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the I/O task keeps polling to flush our DISCONNECT packet
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a connection attempt failed before ConnAck
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// The broker answered CONNECT with a non-zero return code
    Refused(ConnackCode),
    /// Network, TLS or protocol failure
    Io(String),
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFailure::Refused(code) => write!(f, "refused: {code}"),
            SessionFailure::Io(reason) => f.write_str(reason),
        }
    }
}

/// How an I/O task ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    /// Stop requested; no further attempts
    Shutdown,
    /// An established session dropped
    Lost(String),
    /// The attempt never reached ConnAck
    Failed(SessionFailure),
}

/// Mutable session state, only touched with the session lock held
#[derive(Default)]
struct Session {
    /// Bumped by every connect/disconnect; background tasks carry a copy
    generation: u64,
    /// Request side of the live connection, None between attempts
    client: Option<AsyncClient>,
    shutdown_tx: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
    /// Outcome of the most recent failed attempt
    last_failure: Option<SessionFailure>,
}

struct Shared {
    config: ConnectionConfig,
    session: Mutex<Session>,
    state: StateCell,
    state_tx: watch::Sender<ConnectionState>,
    registry: TopicRegistry,
    stats: ConnectionStats,
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a new state; the `&mut Session` proves the lock is held
    fn set_state(&self, _session: &mut Session, to: ConnectionState) {
        let from = self.state.swap(to);
        if from != to {
            HealthMonitor::log_state_transition(from, to);
            self.state_tx.send_replace(to);
        }
    }

    /// Transition on behalf of a background task, unless superseded
    fn transition(&self, generation: u64, to: ConnectionState) -> bool {
        let mut session = self.lock_session();
        if session.generation != generation {
            return false;
        }
        self.set_state(&mut session, to);
        true
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_disconnect(&self, reason: &DisconnectReason) {
        match reason {
            DisconnectReason::Requested => info!(%reason, "MQTT session ended"),
            DisconnectReason::ConnectionLost(_) | DisconnectReason::Unreachable(_) => {
                warn!(%reason, "MQTT session ended")
            }
            _ => error!(%reason, "MQTT session ended"),
        }
        if let Some(observer) = self.observer() {
            guard_callback("on_disconnect", || observer.on_disconnect(reason));
        }
    }

    /// Create the client/event loop pair for a new attempt
    ///
    /// Returns `Ok(None)` when the generation has been superseded.
    fn begin_attempt(&self, generation: u64) -> Result<Option<EventLoop>, ClientError> {
        let options = configure_mqtt_options(&self.config)?;
        let mut session = self.lock_session();
        if session.generation != generation {
            return Ok(None);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        session.client = Some(client);
        self.set_state(&mut session, ConnectionState::Connecting);
        Ok(Some(event_loop))
    }

    /// Drop the request side of a finished attempt; false when superseded
    fn end_attempt(&self, generation: u64, failure: Option<&SessionFailure>) -> bool {
        let mut session = self.lock_session();
        if session.generation != generation {
            return false;
        }
        session.client = None;
        if let Some(failure) = failure {
            session.last_failure = Some(failure.clone());
        }
        self.stats.record_disconnected();
        true
    }

    /// ConnAck: mark connected and replay every registered filter
    fn on_connack(self: &Arc<Self>, generation: u64, session_present: bool) -> Option<SessionContext> {
        let mut session = self.lock_session();
        if session.generation != generation {
            return None;
        }
        self.set_state(&mut session, ConnectionState::Connected);
        self.stats.record_connected();
        session.last_failure = None;

        let filters = self.registry.filters();
        if let (Some(client), false) = (&session.client, filters.is_empty()) {
            let replay = filters
                .iter()
                .map(|(pattern, qos)| SubscribeFilter::new(pattern.clone(), *qos));
            match client.try_subscribe_many(replay) {
                Ok(()) => info!(count = filters.len(), "Replayed subscriptions"),
                Err(e) => error!(error = %e, "Failed to replay subscriptions"),
            }
        }
        drop(session);

        Some(SessionContext {
            client_id: self.config.client_id.clone(),
            session_present,
            replayed: filters.into_iter().map(|(pattern, _)| pattern).collect(),
            handle: ClientHandle {
                shared: Arc::clone(self),
            },
        })
    }

    fn deliver(&self, publish: Publish) {
        let message = InboundMessage::from_publish(publish);
        self.stats.record_message(message.received_at);
        let report = self.registry.dispatch(&message);
        debug!(
            target: "mqtt_transport",
            topic = %message.topic,
            matched = report.matched,
            failed = report.failed,
            "Dispatched inbound message"
        );
    }
}

/// Passed to `on_connect` after every successful (re)connect
#[derive(Clone)]
pub struct SessionContext {
    pub client_id: String,
    /// Broker reported a stored session for this client id
    pub session_present: bool,
    /// Filters re-issued to the broker, in registration order
    pub replayed: Vec<String>,
    handle: ClientHandle,
}

impl SessionContext {
    /// Handle for post-connect actions such as announcing presence
    pub fn client(&self) -> &ClientHandle {
        &self.handle
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("client_id", &self.client_id)
            .field("session_present", &self.session_present)
            .field("replayed", &self.replayed)
            .finish()
    }
}

/// Cheap, cloneable handle for publishing and subscribing
///
/// Usable from any context, including handlers running on the I/O task.
/// None of its methods wait on network I/O: requests are queued for the
/// I/O task and fail immediately when the queue is full.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("client_id", &self.shared.config.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Zero counters and message history; uptime keeps running
    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    pub fn default_qos(&self) -> QoS {
        self.shared.config.default_qos
    }

    /// Watch state transitions as they are published
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Publish to a concrete topic; fails unless `Connected`
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<()> {
        validate_topic_name(topic).map_err(|reason| ClientError::InvalidTopic {
            topic: topic.to_string(),
            reason,
        })?;
        let payload = payload.into();
        let size = publish_packet_size(topic, qos, payload.len());
        let max = self.shared.config.max_packet_size;
        if size > max {
            return Err(ClientError::PayloadTooLarge { size, max });
        }

        let session = self.shared.lock_session();
        let state = self.shared.state.load();
        let client = match (&session.client, HealthMonitor::can_publish(&state)) {
            (Some(client), true) => client,
            _ => return Err(ClientError::NotConnected { state }),
        };

        client.try_publish(topic, qos, retain, payload)?;
        debug!(target: "mqtt_transport", topic, ?qos, retain, "Queued publish");
        Ok(())
    }

    /// Serialize `value` as JSON and publish it
    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, qos, retain)
    }

    /// Register `handler` for `pattern` and subscribe if connected
    ///
    /// Registrations made while not connected are issued on the next
    /// successful connect. Only a malformed pattern is an error.
    pub fn subscribe(
        &self,
        pattern: &str,
        qos: QoS,
        handler: impl SubscriptionHandler + 'static,
    ) -> ClientResult<SubscriptionId> {
        self.subscribe_shared(pattern, qos, Arc::new(handler))
    }

    pub fn subscribe_shared(
        &self,
        pattern: &str,
        qos: QoS,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> ClientResult<SubscriptionId> {
        let id = self.shared.registry.register(pattern, qos, handler)?;

        let session = self.shared.lock_session();
        match (&session.client, self.shared.state.load()) {
            (Some(client), ConnectionState::Connected) => {
                if let Err(e) = client.try_subscribe(pattern, qos) {
                    warn!(pattern, error = %e, "Subscribe not sent, will be replayed on reconnect");
                }
            }
            (_, state) => {
                debug!(target: "mqtt_transport", pattern, %state, "Subscription queued for next connect");
            }
        }
        Ok(id)
    }

    /// Remove every handler for `pattern` and unsubscribe if connected
    pub fn unsubscribe(&self, pattern: &str) -> ClientResult<()> {
        if self.shared.registry.remove_pattern(pattern) == 0 {
            return Err(ClientError::NotSubscribed(pattern.to_string()));
        }
        self.send_unsubscribe(pattern);
        Ok(())
    }

    /// Remove one handler; the broker subscription goes with the last one
    pub fn remove_subscription(&self, id: SubscriptionId) -> ClientResult<()> {
        match self.shared.registry.remove(id) {
            Some((pattern, true)) => {
                self.send_unsubscribe(&pattern);
                Ok(())
            }
            Some((_, false)) => Ok(()),
            None => Err(ClientError::NotSubscribed(format!("{id:?}"))),
        }
    }

    /// Currently registered filters with their effective QoS
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.shared.registry.filters()
    }

    fn send_unsubscribe(&self, pattern: &str) {
        let session = self.shared.lock_session();
        if let (Some(client), ConnectionState::Connected) = (&session.client, self.shared.state.load())
        {
            if let Err(e) = client.try_unsubscribe(pattern) {
                warn!(pattern, error = %e, "Unsubscribe not sent");
            }
        }
    }
}

impl Transport for ClientHandle {
    type Error = ClientError;

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> ClientResult<()> {
        ClientHandle::publish(self, topic, payload, qos, retain)
    }

    fn subscribe(
        &self,
        pattern: &str,
        qos: QoS,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> ClientResult<SubscriptionId> {
        self.subscribe_shared(pattern, qos, handler)
    }

    fn unsubscribe(&self, pattern: &str) -> ClientResult<()> {
        ClientHandle::unsubscribe(self, pattern)
    }

    fn is_connected(&self) -> bool {
        ClientHandle::is_connected(self)
    }

    fn state(&self) -> ConnectionState {
        ClientHandle::state(self)
    }
}

/// Resilient MQTT client owning the session lifecycle
///
/// Dropping the client stops its background tasks without a clean
/// DISCONNECT; call [`MqttClient::disconnect`] for a graceful shutdown.
pub struct MqttClient {
    handle: ClientHandle,
}

impl fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttClient")
            .field("broker", &self.handle.shared.config.broker_address())
            .field("client_id", &self.handle.client_id())
            .field("state", &self.handle.state())
            .finish()
    }
}

impl MqttClient {
    /// Build a client; configuration errors are reported here, not on connect
    pub fn new(config: ConnectionConfig) -> ClientResult<Self> {
        configure_mqtt_options(&config)?;
        config.reconnect.validate().map_err(|reason| {
            ClientError::Config(ConfigError::InvalidConfig(format!(
                "invalid reconnect policy: {reason}"
            )))
        })?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            config,
            session: Mutex::new(Session::default()),
            state: StateCell::new(ConnectionState::Disconnected),
            state_tx,
            registry: TopicRegistry::new(),
            stats: ConnectionStats::new(),
            observer: RwLock::new(None),
        });

        Ok(Self {
            handle: ClientHandle { shared },
        })
    }

    /// Install the connect/disconnect observer, replacing any previous one
    pub fn set_observer(&self, observer: impl ConnectionObserver + 'static) {
        *self
            .handle
            .shared
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.handle.shared.config
    }

    /// Connect and wait for ConnAck
    ///
    /// Returns once `Connected`, or with an error when the attempt is
    /// refused, the retry budget runs out, or `connect_timeout` elapses.
    /// On timeout the supervisor keeps retrying in the background.
    pub async fn connect(&self) -> ClientResult<()> {
        let shared = &self.handle.shared;
        let state_rx = {
            let mut session = shared.lock_session();
            match shared.state.load() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    shared.state_tx.subscribe()
                }
                ConnectionState::Disconnected | ConnectionState::Error(_) => {
                    session.generation += 1;
                    let generation = session.generation;
                    let (shutdown_tx, shutdown_rx) = watch::channel(false);
                    session.shutdown_tx = Some(shutdown_tx);
                    session.last_failure = None;
                    shared.set_state(&mut session, ConnectionState::Connecting);

                    let state_rx = shared.state_tx.subscribe();
                    let span = crate::session_span!(
                        client_id = %shared.config.client_id,
                        broker = %shared.config.broker_address(),
                        generation
                    );
                    session.supervisor = Some(tokio::spawn(
                        Self::supervise(Arc::clone(shared), generation, shutdown_rx).instrument(span),
                    ));
                    state_rx
                }
            }
        };

        let timeout = shared.config.connect_timeout;
        match Self::wait_for_connection_confirmation(state_rx, timeout).await {
            Some(ConnectionState::Connected) => Ok(()),
            Some(ConnectionState::Error(ErrorCode::Refused(code))) => Err(ClientError::Refused(code)),
            Some(ConnectionState::Error(ErrorCode::RetriesExhausted)) => {
                Err(ClientError::RetriesExhausted {
                    attempts: shared.config.reconnect.max_attempts.unwrap_or_default(),
                })
            }
            Some(_) => Err(match shared.lock_session().last_failure.clone() {
                Some(SessionFailure::Refused(code)) => ClientError::Refused(code),
                Some(SessionFailure::Io(reason)) => ClientError::ConnectionFailed(reason),
                None => ClientError::ConnectionFailed("disconnected while connecting".to_string()),
            }),
            None => Err(ClientError::Timeout(timeout)),
        }
    }

    /// Wait until the state settles on `Connected`, `Error` or `Disconnected`
    ///
    /// Returns the settled state, or None on timeout.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Option<ConnectionState> {
        tokio::time::timeout(timeout, async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                    settled => return settled,
                }
                if state_rx.changed().await.is_err() {
                    return ConnectionState::Disconnected;
                }
            }
        })
        .await
        .ok()
    }

    /// Stop reconnecting, send DISCONNECT if connected, stop background tasks
    ///
    /// Idempotent. Also clears a terminal `Error` back to `Disconnected`.
    pub async fn disconnect(&self) {
        let shared = &self.handle.shared;
        let (supervisor, was_connected) = {
            let mut session = shared.lock_session();
            session.generation += 1;
            let was_connected = shared.state.load() == ConnectionState::Connected;

            if let Some(client) = session.client.take() {
                if was_connected {
                    if let Err(e) = client.try_disconnect() {
                        debug!(target: "mqtt_transport", error = %e, "DISCONNECT not queued");
                    }
                }
            }
            if let Some(shutdown_tx) = session.shutdown_tx.take() {
                let _ = shutdown_tx.send(true);
                debug!(target: "mqtt_transport", "Sent shutdown signal to reconnection supervisor");
            }
            shared.set_state(&mut session, ConnectionState::Disconnected);
            shared.stats.record_disconnected();
            (session.supervisor.take(), was_connected)
        };

        if let Some(mut handle) = supervisor {
            match tokio::time::timeout(SUPERVISOR_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(target: "mqtt_transport", "Supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Supervisor ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Supervisor didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }

        if was_connected {
            shared.notify_disconnect(&DisconnectReason::Requested);
        }
    }

    /// Reconnection supervisor for one session generation
    async fn supervise(shared: Arc<Shared>, generation: u64, shutdown_rx: watch::Receiver<bool>) {
        let policy: &ReconnectPolicy = &shared.config.reconnect;
        let mut failed_attempts = 0u32;

        loop {
            let end = match shared.begin_attempt(generation) {
                Ok(Some(event_loop)) => {
                    let io_task = tokio::spawn(
                        Self::run_session(
                            Arc::clone(&shared),
                            generation,
                            event_loop,
                            shutdown_rx.clone(),
                        )
                        .in_current_span(),
                    );
                    match io_task.await {
                        Ok(end) => end,
                        Err(e) => SessionEnd::Failed(SessionFailure::Io(format!("I/O task failed: {e}"))),
                    }
                }
                Ok(None) => return,
                Err(e) => SessionEnd::Failed(SessionFailure::Io(e.to_string())),
            };

            // Reason of a dropped established session, None for failed attempts
            let (failure, lost) = match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Lost(reason) => {
                    if !shared.end_attempt(generation, None) {
                        return;
                    }
                    failed_attempts = 0;
                    (SessionFailure::Io(reason.clone()), Some(reason))
                }
                SessionEnd::Failed(failure) => {
                    if !shared.end_attempt(generation, Some(&failure)) {
                        return;
                    }
                    warn!(%failure, "MQTT connection attempt failed");
                    (failure, None)
                }
            };

            if let SessionFailure::Refused(code) = failure {
                if !code.is_retryable() {
                    if shared.transition(generation, ConnectionState::Error(ErrorCode::Refused(code))) {
                        shared.notify_disconnect(&DisconnectReason::Refused(code));
                    }
                    return;
                }
            }

            let shutdown_requested = *shutdown_rx.borrow();
            match policy.next_attempt(failed_attempts, shutdown_requested) {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    if !shared.transition(generation, ConnectionState::Reconnecting) {
                        return;
                    }
                    if let Some(reason) = lost {
                        shared.notify_disconnect(&DisconnectReason::ConnectionLost(reason));
                    }
                    shared.stats.record_reconnect_attempt(attempt);
                    info!(
                        "Attempting reconnection {}/{} after {}ms delay",
                        attempt,
                        policy.max_attempts_display(),
                        delay.as_millis()
                    );

                    if !Self::interruptible_sleep(shutdown_rx.clone(), delay).await {
                        return;
                    }
                    failed_attempts = attempt;
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown signal received, stopping reconnection");
                    return;
                }
                ReconnectionDecision::AbortDisabled => {
                    if shared.transition(generation, ConnectionState::Disconnected) {
                        let reason = match (lost, failure) {
                            (Some(reason), _) => DisconnectReason::ConnectionLost(reason),
                            (None, SessionFailure::Refused(code)) => DisconnectReason::Refused(code),
                            (None, SessionFailure::Io(reason)) => DisconnectReason::Unreachable(reason),
                        };
                        shared.notify_disconnect(&reason);
                    }
                    return;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    if shared.transition(generation, ConnectionState::Error(ErrorCode::RetriesExhausted)) {
                        shared.notify_disconnect(&DisconnectReason::RetriesExhausted {
                            attempts: failed_attempts,
                        });
                    }
                    return;
                }
            }
        }
    }

    /// I/O task: poll the event loop until the session ends
    async fn run_session(
        shared: Arc<Shared>,
        generation: u64,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut connected = false;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        if connected {
                            Self::flush_disconnect(&mut event_loop).await;
                        }
                        return SessionEnd::Shutdown;
                    }
                }

                polled = event_loop.poll() => {
                    let event = match polled {
                        Ok(event) => event,
                        Err(ConnectionError::ConnectionRefused(code)) => {
                            return SessionEnd::Failed(SessionFailure::Refused(
                                ConnackCode::from_return_code(code),
                            ));
                        }
                        Err(e) if connected => return SessionEnd::Lost(e.to_string()),
                        Err(e) => return SessionEnd::Failed(SessionFailure::Io(e.to_string())),
                    };

                    match MessageHandler::route_mqtt_event(event) {
                        EventRoute::ConnectionAcknowledged { session_present } => {
                            let Some(context) = shared.on_connack(generation, session_present) else {
                                return SessionEnd::Shutdown;
                            };
                            connected = true;
                            if let Some(observer) = shared.observer() {
                                guard_callback("on_connect", || observer.on_connect(&context));
                            }
                        }
                        EventRoute::MessageReceived(publish) => shared.deliver(publish),
                        EventRoute::Disconnected => {
                            let reason = "broker closed the session".to_string();
                            return if connected {
                                SessionEnd::Lost(reason)
                            } else {
                                SessionEnd::Failed(SessionFailure::Io(reason))
                            };
                        }
                        EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                            let rejected = MessageHandler::rejected_filters(&granted);
                            if rejected.is_empty() {
                                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed: {:?}", granted);
                            } else {
                                warn!(packet_id, ?rejected, "Broker rejected subscription filters");
                            }
                        }
                        EventRoute::UnsubscribeConfirmed { packet_id } => {
                            debug!(target: "mqtt_transport", packet_id, "Unsubscribe confirmed");
                        }
                        EventRoute::InfrastructureEvent(event_str) => {
                            tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                        }
                        EventRoute::DisconnectSent => return SessionEnd::Shutdown,
                        EventRoute::OutgoingEvent => {}
                    }
                }
            }
        }
    }

    /// Keep polling until our queued DISCONNECT has been written
    async fn flush_disconnect(event_loop: &mut EventLoop) {
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!(target: "mqtt_transport", "DISCONNECT not flushed before timeout");
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        if *shutdown_rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    pub fn reset_stats(&self) {
        self.handle.reset_stats();
    }

    pub fn client_id(&self) -> &str {
        self.handle.client_id()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.handle.state_changes()
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<()> {
        self.handle.publish(topic, payload, qos, retain)
    }

    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<()> {
        self.handle.publish_json(topic, value, qos, retain)
    }

    pub fn subscribe(
        &self,
        pattern: &str,
        qos: QoS,
        handler: impl SubscriptionHandler + 'static,
    ) -> ClientResult<SubscriptionId> {
        self.handle.subscribe(pattern, qos, handler)
    }

    pub fn unsubscribe(&self, pattern: &str) -> ClientResult<()> {
        self.handle.unsubscribe(pattern)
    }

    pub fn remove_subscription(&self, id: SubscriptionId) -> ClientResult<()> {
        self.handle.remove_subscription(id)
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.handle.subscriptions()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        let mut session = shared.lock_session();
        session.generation += 1;
        session.client = None;

        // Signal shutdown to background tasks if they're still running
        if let Some(shutdown_tx) = session.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = session.supervisor.take() {
            handle.abort();
        }
        shared.set_state(&mut session, ConnectionState::Disconnected);
    }
}

/// Encoded size of a v3.1.1 PUBLISH, fixed header included
fn publish_packet_size(topic: &str, qos: QoS, payload_len: usize) -> usize {
    let packet_id = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = 2 + topic.len() + packet_id + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}
