//! STOMP 1.2 over WebSocket
//!
//! One background task per activation owns the socket. It sends CONNECT with
//! the credential headers, routes MESSAGE frames to subscription handlers in
//! arrival order, keeps heart-beats flowing, and after a drop of an
//! acknowledged connection reconnects with a fixed delay up to the configured
//! number of attempts. A connection that was never acknowledged is not
//! retried here.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NotifyConfig;
use crate::error::{NotifyError, Result};
use crate::frame::{Command, Frame, FrameReader, Heartbeat};
use crate::transport::{
    Activation, ConnectHeaders, FrameHandler, Session, SessionEvent, SubscriptionHandle,
    Transport,
};

#[derive(Debug, Clone)]
struct Settings {
    url: String,
    host: String,
    heartbeat_outgoing: Duration,
    heartbeat_incoming: Duration,
    reconnect_delay: Duration,
    max_attempts: u32,
    max_frame_size: usize,
}

/// Opens STOMP sessions over WebSocket
#[derive(Debug, Clone)]
pub struct StompTransport {
    settings: Settings,
}

impl StompTransport {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            settings: Settings {
                url: config.url.clone(),
                host: config.effective_host(),
                heartbeat_outgoing: config.heartbeat_outgoing,
                heartbeat_incoming: config.heartbeat_incoming,
                reconnect_delay: config.reconnect_delay,
                max_attempts: config.max_attempts,
                max_frame_size: config.max_frame_size,
            },
        }
    }
}

impl Transport for StompTransport {
    fn activate(&self, headers: ConnectHeaders) -> Activation {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            routes: Mutex::new(HashMap::new()),
            commands: commands_tx,
            connected: AtomicBool::new(false),
        });

        tokio::spawn(run_session(
            self.settings.clone(),
            headers,
            shared.clone(),
            commands_rx,
            events_tx,
            shutdown_rx,
        ));

        Activation {
            session: Arc::new(StompSession {
                shared,
                shutdown: shutdown_tx,
            }),
            events: events_rx,
        }
    }
}

/// State shared between the session handle and its task
struct Shared {
    // subscription id -> handler
    routes: Mutex<HashMap<String, FrameHandler>>,
    commands: mpsc::UnboundedSender<Frame>,
    connected: AtomicBool,
}

impl Shared {
    /// Forget everything tied to the current connection
    fn reset(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.routes.lock().clear();
    }

    fn deliver(&self, frame: &Frame) {
        let Some(id) = frame.get("subscription") else {
            warn!("MESSAGE frame without subscription header");
            return;
        };

        let handler = self.routes.lock().get(id).cloned();
        match handler {
            Some(handler) => handler(&frame.body),
            None => debug!(
                subscription = id,
                destination = ?frame.get("destination"),
                "No route for message"
            ),
        }
    }
}

/// Handle to a STOMP session. Dropping it deactivates the session.
pub struct StompSession {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl Session for StompSession {
    fn subscribe(
        &self,
        destination: &str,
        handler: FrameHandler,
    ) -> Result<Box<dyn SubscriptionHandle>> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(NotifyError::NotConnected);
        }

        let id = format!("sub-{}", Uuid::new_v4());
        self.shared.routes.lock().insert(id.clone(), handler);

        let frame = Frame::new(Command::Subscribe)
            .header("id", &id)
            .header("destination", destination)
            .header("ack", "auto");
        if self.shared.commands.send(frame).is_err() {
            self.shared.routes.lock().remove(&id);
            return Err(NotifyError::Transport("session task has ended".into()));
        }

        debug!(%destination, subscription = %id, "Subscribed");
        Ok(Box::new(StompSubscription {
            id,
            destination: destination.to_string(),
            shared: Arc::downgrade(&self.shared),
        }))
    }

    fn deactivate(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for StompSession {
    fn drop(&mut self) {
        self.deactivate();
    }
}

struct StompSubscription {
    id: String,
    destination: String,
    shared: Weak<Shared>,
}

impl SubscriptionHandle for StompSubscription {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn unsubscribe(self: Box<Self>) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(NotifyError::NotConnected)?;

        // The route is gone if the connection it was made on dropped
        if shared.routes.lock().remove(&self.id).is_none() {
            return Err(NotifyError::NotConnected);
        }

        shared
            .commands
            .send(Frame::new(Command::Unsubscribe).header("id", &self.id))
            .map_err(|_| NotifyError::Transport("session task has ended".into()))
    }
}

/// Why a single WebSocket connection ended
#[derive(Debug)]
enum ConnectionEnd {
    Shutdown,
    Rejected(String),
    Closed(String),
    Failed(String),
}

async fn run_session(
    settings: Settings,
    headers: ConnectHeaders,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;
    let mut established = false;

    loop {
        let (end, acknowledged) = run_connection(
            &settings,
            &headers,
            &shared,
            &mut commands,
            &events,
            &mut shutdown,
        )
        .await;
        shared.reset();

        if acknowledged {
            established = true;
            attempt = 0;
        }

        let event = match end {
            ConnectionEnd::Shutdown => {
                debug!("Session deactivated");
                return;
            }
            ConnectionEnd::Rejected(message) => SessionEvent::StompError(message),
            ConnectionEnd::Closed(reason) => SessionEvent::WebSocketClose(reason),
            ConnectionEnd::Failed(message) => SessionEvent::WebSocketError(message),
        };
        if events.send(event).is_err() || !established {
            return;
        }

        attempt += 1;
        if attempt > settings.max_attempts {
            warn!(max = settings.max_attempts, "Giving up reconnecting");
            let _ = events.send(SessionEvent::RetriesExhausted);
            return;
        }

        info!(
            attempt,
            max = settings.max_attempts,
            delay = ?settings.reconnect_delay,
            "Reconnecting"
        );
        tokio::select! {
            () = tokio::time::sleep(settings.reconnect_delay) => {}
            () = stopped(&mut shutdown) => return,
        }
    }
}

async fn run_connection(
    settings: &Settings,
    headers: &ConnectHeaders,
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Frame>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> (ConnectionEnd, bool) {
    // Frames queued for a previous connection are meaningless now
    while commands.try_recv().is_ok() {}

    debug!(url = %settings.url, "Opening WebSocket");
    let ws = tokio::select! {
        result = connect_async(settings.url.as_str()) => match result {
            Ok((ws, _)) => ws,
            Err(e) => return (ConnectionEnd::Failed(e.to_string()), false),
        },
        () = stopped(shutdown) => return (ConnectionEnd::Shutdown, false),
    };
    let (mut sink, mut stream) = ws.split();

    let mut connect = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", &settings.host)
        .header(
            "heart-beat",
            Heartbeat::offer(settings.heartbeat_outgoing, settings.heartbeat_incoming),
        );
    for (name, value) in headers.iter() {
        connect = connect.header(name, value);
    }
    if let Err(e) = sink.send(Message::Text(connect.encode_text().into())).await {
        return (ConnectionEnd::Failed(e.to_string()), false);
    }

    let mut reader = FrameReader::new(settings.max_frame_size);
    let mut acknowledged = false;
    let mut outgoing: Option<Interval> = None;
    let mut incoming: Option<Duration> = None;
    let mut last_seen = Instant::now();

    let end = 'conn: loop {
        let silence_deadline = incoming.map(|period| last_seen + period * 2);

        tokio::select! {
            () = stopped(shutdown) => {
                // UNSUBSCRIBEs queued by the teardown go out ahead of DISCONNECT
                while let Ok(frame) = commands.try_recv() {
                    let _ = sink.send(Message::Text(frame.encode_text().into())).await;
                }
                let bye = Frame::new(Command::Disconnect).header("receipt", "disconnect");
                let _ = sink.send(Message::Text(bye.encode_text().into())).await;
                let _ = sink.close().await;
                break ConnectionEnd::Shutdown;
            }

            Some(frame) = commands.recv() => {
                debug!(command = ?frame.command, "Sending frame");
                if let Err(e) = sink.send(Message::Text(frame.encode_text().into())).await {
                    break ConnectionEnd::Failed(e.to_string());
                }
            }

            () = tick(&mut outgoing) => {
                if let Err(e) = sink.send(Message::Text("\n".to_string().into())).await {
                    break ConnectionEnd::Failed(e.to_string());
                }
            }

            () = sleep_until(silence_deadline) => {
                warn!("No heart-beat from broker");
                break ConnectionEnd::Failed("heart-beat timeout".into());
            }

            message = stream.next() => {
                last_seen = Instant::now();
                match message {
                    Some(Ok(Message::Text(text))) => reader.push(text.as_str().as_bytes()),
                    Some(Ok(Message::Binary(data))) => reader.push(&data),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "closed by broker".to_string());
                        break ConnectionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break ConnectionEnd::Failed(e.to_string()),
                    None => break ConnectionEnd::Closed("stream ended".to_string()),
                }

                loop {
                    let frame = match reader.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Discarding malformed frame: {}", e);
                            continue;
                        }
                    };

                    match frame.command {
                        Command::Connected => {
                            let heartbeat = Heartbeat::negotiate(
                                settings.heartbeat_outgoing,
                                settings.heartbeat_incoming,
                                frame.get("heart-beat"),
                            );
                            outgoing = heartbeat.outgoing.map(|period| {
                                let mut interval =
                                    tokio::time::interval_at(Instant::now() + period, period);
                                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                interval
                            });
                            incoming = heartbeat.incoming;
                            acknowledged = true;
                            shared.connected.store(true, Ordering::SeqCst);

                            info!(
                                version = frame.get("version").unwrap_or("1.0"),
                                ?heartbeat,
                                "STOMP session established"
                            );
                            let _ = events.send(SessionEvent::Connected);
                        }
                        Command::Message => shared.deliver(&frame),
                        Command::Error => {
                            let message = frame
                                .get("message")
                                .or_else(|| frame.body_str())
                                .unwrap_or("unspecified error")
                                .to_string();
                            if !acknowledged {
                                break 'conn ConnectionEnd::Rejected(message);
                            }
                            warn!(%message, "Broker sent ERROR frame");
                            let _ = events.send(SessionEvent::StompError(message));
                        }
                        Command::Receipt => debug!(receipt = ?frame.get("receipt-id"), "Receipt"),
                        other => debug!(command = ?other, "Ignoring frame"),
                    }
                }
            }
        }
    };

    (end, acknowledged)
}

/// Resolves once the session has been deactivated
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
