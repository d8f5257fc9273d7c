//! In-memory transport for lifecycle tests

#![allow(dead_code)]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use edunotify::transport::{
    Activation, ConnectHeaders, FrameHandler, Session, SessionEvent, SubscriptionHandle, Transport,
};
use edunotify::{MemoryStore, NotifyError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// How a freshly activated session answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Acknowledge immediately
    Ack,
    /// Never answer
    Silent,
    /// Emit this event immediately
    Emit(SessionEvent),
}

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    max_live: AtomicUsize,
}

pub struct MockTransport {
    behavior: Mutex<Behavior>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    counters: Arc<Counters>,
}

impl MockTransport {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            sessions: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Number of sessions ever activated
    pub fn activations(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Sessions activated and not yet deactivated
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions.lock()[index].clone()
    }

    pub fn last(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }
}

impl Transport for MockTransport {
    fn activate(&self, headers: ConnectHeaders) -> Activation {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        let session = Arc::new_cyclic(|me| MockSession {
            me: me.clone(),
            headers,
            events: events_tx,
            deactivated: AtomicBool::new(false),
            counters: self.counters.clone(),
            routes: Mutex::new(HashMap::new()),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
        });

        match self.behavior.lock().clone() {
            Behavior::Ack => session.emit(SessionEvent::Connected),
            Behavior::Silent => true,
            Behavior::Emit(event) => session.emit(event),
        };

        self.sessions.lock().push(session.clone());
        Activation {
            session,
            events: events_rx,
        }
    }
}

pub struct MockSession {
    me: Weak<MockSession>,
    pub headers: ConnectHeaders,
    events: mpsc::UnboundedSender<SessionEvent>,
    deactivated: AtomicBool,
    counters: Arc<Counters>,
    routes: Mutex<HashMap<String, FrameHandler>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl MockSession {
    /// Push a lifecycle event; false if nobody is listening any more
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Deliver a frame body to whoever subscribed `destination`
    pub fn deliver(&self, destination: &str, body: &[u8]) -> bool {
        let handler = self.routes.lock().get(destination).cloned();
        match handler {
            Some(handler) => {
                handler(body);
                true
            }
            None => false,
        }
    }

    /// Simulate the socket dropping: routes die with it
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.routes.lock().clear();
        self.emit(SessionEvent::WebSocketClose(reason.to_string()))
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<_> = self.routes.lock().keys().cloned().collect();
        destinations.sort();
        destinations
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }
}

impl Session for MockSession {
    fn subscribe(
        &self,
        destination: &str,
        handler: FrameHandler,
    ) -> Result<Box<dyn SubscriptionHandle>> {
        if self.is_deactivated() {
            return Err(NotifyError::NotConnected);
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.routes.lock().insert(destination.to_string(), handler);

        Ok(Box::new(MockHandle {
            destination: destination.to_string(),
            session: self.me.clone(),
        }))
    }

    fn deactivate(&self) {
        if !self.deactivated.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.routes.lock().clear();
        }
    }
}

struct MockHandle {
    destination: String,
    session: Weak<MockSession>,
}

impl SubscriptionHandle for MockHandle {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn unsubscribe(self: Box<Self>) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => {
                session.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
                session.routes.lock().remove(&self.destination);
                Ok(())
            }
            None => Err(NotifyError::NotConnected),
        }
    }
}

/// Unsigned JWT-shaped token for `subject`
pub fn token_for(subject: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}"}}"#, subject));
    format!("{}.{}.sig", header, payload)
}

pub fn signed_in_store(subject: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.set("authToken", token_for(subject));
    store
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
