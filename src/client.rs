//! Connection lifecycle
//!
//! [`NotificationClient`] owns the transport session, the connection state and
//! the attempt counter. Each activation gets a driver task that consumes the
//! session's events and enforces the connect timeout; `disconnect()` aborts
//! that task, so a timer never outlives the attempt it belongs to.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::config::NotifyConfig;
use crate::credentials::{CredentialResolver, CredentialStore, Identity};
use crate::dispatcher::{Dispatcher, InboundEvent, LogSink, NotificationSink};
use crate::error::{NotifyError, Result};
use crate::registry::SubscriptionRegistry;
use crate::transport::stomp::StompTransport;
use crate::transport::{ConnectHeaders, Session, SessionEvent, Transport};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Waiting for the broker to acknowledge
    Connecting,
    /// Connected and subscribed
    Connected,
    /// Not connected; a later `connect()` may succeed
    Disconnected,
    /// Attempts exhausted; only `disconnect()` clears this
    Failed,
}

/// The session of the current activation
struct ActiveSession {
    generation: u64,
    session: Arc<dyn Session>,
    driver: Option<AbortHandle>,
}

/// State guarded by one lock so transitions are atomic
struct Core {
    attempts: u32,
    generation: u64,
    identity: Option<Identity>,
    active: Option<ActiveSession>,
    pending: Option<oneshot::Sender<Result<()>>>,
}

struct ClientInner {
    config: NotifyConfig,
    transport: Arc<dyn Transport>,
    credentials: CredentialResolver,
    dispatcher: Arc<Dispatcher>,
    registry: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    core: Mutex<Core>,
}

/// Real-time notification client
///
/// Construct one at startup and hand clones to whatever needs to connect,
/// disconnect or register the callback. Cheap to clone.
#[derive(Clone)]
pub struct NotificationClient {
    inner: Arc<ClientInner>,
}

impl NotificationClient {
    /// Create a client that logs notifications instead of showing them
    pub fn new(
        config: NotifyConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self::with_sink(config, transport, store, Arc::new(LogSink))
    }

    /// Create a client that speaks STOMP over WebSocket to `config.url`
    pub fn stomp(config: NotifyConfig, store: Arc<dyn CredentialStore>) -> Self {
        let transport = Arc::new(StompTransport::new(&config));
        Self::new(config, transport, store)
    }

    pub fn with_sink(
        config: NotifyConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let dispatcher = Arc::new(Dispatcher::new(sink));
        let credentials = CredentialResolver::new(store, config.token_key.clone());
        let registry = SubscriptionRegistry::new(state_rx.clone(), dispatcher.clone());

        let inner = Arc::new(ClientInner {
            config,
            transport,
            credentials,
            dispatcher,
            registry,
            state: state_tx,
            state_rx,
            core: Mutex::new(Core {
                attempts: 0,
                generation: 0,
                identity: None,
                active: None,
                pending: None,
            }),
        });

        Self { inner }
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Connect attempts made since the last success or reset
    pub fn attempts(&self) -> u32 {
        self.inner.core.lock().attempts
    }

    /// Identity of the current connection
    pub fn identity(&self) -> Option<Identity> {
        self.inner.core.lock().identity.clone()
    }

    /// Channels with a live subscription
    pub fn subscribed_channels(&self) -> Vec<Channel> {
        self.inner.registry.channels()
    }

    /// Register the consumer of decoded notifications, replacing any previous one
    pub fn set_notification_callback<F>(&self, callback: F)
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_callback(Arc::new(callback));
    }

    /// Connect, authenticate and subscribe.
    ///
    /// Returns `Ok` at once if already connecting or connected, or while the
    /// transport is recovering a dropped session on its own.
    pub async fn connect(&self) -> Result<()> {
        let outcome = {
            let mut core = self.inner.core.lock();

            let state = self.connection_state();
            if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
                debug!(?state, "Connect requested while already {:?}", state);
                return Ok(());
            }
            if core.active.is_some() {
                debug!("Transport is reconnecting; not opening another session");
                return Ok(());
            }

            let Some(credential) = self.inner.credentials.resolve() else {
                info!("No credential; not connecting");
                return Err(NotifyError::NoCredential);
            };

            let max = self.inner.config.max_attempts;
            if core.attempts >= max {
                warn!(attempts = core.attempts, max, "Connect attempts exhausted");
                self.inner.set_state(ConnectionState::Failed);
                return Err(NotifyError::RetryExhausted { max });
            }
            core.attempts += 1;

            core.generation += 1;
            let generation = core.generation;

            info!(
                attempt = core.attempts,
                max,
                identity = %credential.identity(),
                url = %self.inner.config.url,
                "Connecting"
            );
            self.inner.set_state(ConnectionState::Connecting);

            let activation = self
                .inner
                .transport
                .activate(ConnectHeaders::bearer(credential.token()));

            let (tx, rx) = oneshot::channel();
            core.pending = Some(tx);
            core.identity = Some(credential.identity().clone());
            core.active = Some(ActiveSession {
                generation,
                session: activation.session,
                driver: None,
            });

            let driver = tokio::spawn(drive(
                self.inner.clone(),
                generation,
                activation.events,
            ));
            if let Some(active) = core.active.as_mut() {
                active.driver = Some(driver.abort_handle());
            }

            rx
        };

        outcome.await.unwrap_or(Err(NotifyError::Cancelled))
    }

    /// Unsubscribe everything, close the session and reset the attempt
    /// counter. A no-op when there is nothing to tear down.
    pub fn disconnect(&self) {
        let mut core = self.inner.core.lock();

        let state = self.connection_state();
        if matches!(state, ConnectionState::Idle | ConnectionState::Disconnected)
            && core.active.is_none()
        {
            debug!(?state, "Disconnect requested with no session");
            return;
        }

        if let Some(pending) = core.pending.take() {
            let _ = pending.send(Err(NotifyError::Cancelled));
        }

        let removed = self.inner.registry.detach_all();

        if let Some(active) = core.active.take() {
            if let Some(driver) = active.driver {
                driver.abort();
            }
            active.session.deactivate();
        }

        core.identity = None;
        core.attempts = 0;
        self.inner.set_state(ConnectionState::Disconnected);
        info!(unsubscribed = removed, "Disconnected");
    }
}

/// What the driver does after an event
enum Step {
    Continue,
    Acknowledged,
    Stop,
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "State change");
        }
    }

    fn is_current(core: &Core, generation: u64) -> bool {
        core.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn handle_event(&self, generation: u64, event: SessionEvent) -> Step {
        let mut core = self.core.lock();
        if !Self::is_current(&core, generation) {
            return Step::Stop;
        }

        match event {
            SessionEvent::Connected => {
                self.on_acknowledged(&mut core);
                Step::Acknowledged
            }
            SessionEvent::StompError(message) => {
                if core.pending.is_some() {
                    self.fail_attempt(&mut core, NotifyError::ProtocolError(message));
                    return Step::Stop;
                }
                warn!(%message, "Broker reported an error");
                Step::Continue
            }
            SessionEvent::WebSocketClose(reason) => {
                if core.pending.is_some() {
                    self.fail_attempt(&mut core, NotifyError::UnexpectedClose(reason));
                    return Step::Stop;
                }
                self.on_dropped(&reason);
                Step::Continue
            }
            SessionEvent::WebSocketError(message) => {
                if core.pending.is_some() {
                    self.fail_attempt(&mut core, NotifyError::Transport(message));
                    return Step::Stop;
                }
                self.on_dropped(&message);
                Step::Continue
            }
            SessionEvent::RetriesExhausted => {
                error!("Transport gave up reconnecting");
                self.registry.discard_all();
                self.dispose(&mut core);
                core.attempts = self.config.max_attempts;
                self.set_state(ConnectionState::Failed);
                Step::Stop
            }
        }
    }

    fn on_acknowledged(&self, core: &mut Core) {
        self.set_state(ConnectionState::Connected);
        core.attempts = 0;

        let session = core.active.as_ref().map(|active| active.session.clone());
        match (session, core.identity.clone()) {
            (Some(session), Some(identity)) => {
                if let Err(e) = self.registry.attach_all(session.as_ref(), &identity) {
                    warn!("Failed to attach channels: {}", e);
                }
            }
            _ => warn!("Acknowledged without a session identity"),
        }

        match core.pending.take() {
            Some(pending) => {
                info!("Connected");
                let _ = pending.send(Ok(()));
            }
            None => info!("Reconnected"),
        }
    }

    /// The connection dropped after it was acknowledged. The transport owns
    /// recovery; handles from the old connection are useless now.
    fn on_dropped(&self, reason: &str) {
        warn!(%reason, "Connection dropped; transport will retry");
        self.registry.discard_all();
        self.set_state(ConnectionState::Disconnected);
    }

    /// A connect attempt ended without acknowledgment
    fn fail_attempt(&self, core: &mut Core, cause: NotifyError) {
        let exhausted = core.attempts >= self.config.max_attempts;
        warn!(
            attempt = core.attempts,
            max = self.config.max_attempts,
            "Connect attempt failed: {}",
            cause
        );

        self.registry.discard_all();
        self.dispose(core);
        self.set_state(if exhausted {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        });

        if let Some(pending) = core.pending.take() {
            let _ = pending.send(Err(cause));
        }
    }

    /// Drop the session of the current activation. Called from its own
    /// driver, which exits right after.
    fn dispose(&self, core: &mut Core) {
        core.identity = None;
        if let Some(active) = core.active.take() {
            active.session.deactivate();
        }
    }

    /// The event stream ended without a reason
    fn on_session_ended(&self, generation: u64) {
        let mut core = self.core.lock();
        if !Self::is_current(&core, generation) {
            return;
        }

        if core.pending.is_some() {
            self.fail_attempt(
                &mut core,
                NotifyError::UnexpectedClose("session ended".into()),
            );
            return;
        }

        warn!("Session ended");
        self.registry.discard_all();
        self.dispose(&mut core);
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_timeout(&self, generation: u64) {
        let mut core = self.core.lock();
        if !Self::is_current(&core, generation) || core.pending.is_none() {
            return;
        }
        self.fail_attempt(
            &mut core,
            NotifyError::TransportTimeout(self.config.connect_timeout),
        );
    }
}

/// Consume one activation's events and enforce its connect timeout
async fn drive(
    inner: Arc<ClientInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    let deadline = tokio::time::sleep(inner.config.connect_timeout);
    tokio::pin!(deadline);
    let mut awaiting_ack = true;

    loop {
        tokio::select! {
            () = &mut deadline, if awaiting_ack => {
                inner.on_timeout(generation);
                return;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    inner.on_session_ended(generation);
                    return;
                };
                debug!(generation, ?event, "Session event");

                match inner.handle_event(generation, event) {
                    Step::Continue => {}
                    Step::Acknowledged => awaiting_ack = false,
                    Step::Stop => return,
                }
            }
        }
    }
}
