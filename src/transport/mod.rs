//! Session layer seam
//!
//! A [`Transport`] opens sessions; a [`Session`] carries subscriptions and
//! reports its lifecycle as [`SessionEvent`]s on the channel returned with it.
//! [`stomp::StompTransport`] is the production implementation.

pub mod stomp;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;

/// Receives the body of every frame delivered to one subscription
pub type FrameHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Lifecycle notifications from a session, delivered in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The broker acknowledged the connection
    Connected,
    /// The broker sent an error frame
    StompError(String),
    /// The socket closed
    WebSocketClose(String),
    /// The socket failed
    WebSocketError(String),
    /// The session gave up reconnecting after a drop
    RetriesExhausted,
}

/// Headers attached when the session connects
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectHeaders(Vec<(String, String)>);

impl ConnectHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Authorization: Bearer <token>`
    pub fn bearer(token: &str) -> Self {
        Self::new().with("Authorization", format!("Bearer {}", token))
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for ConnectHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|(k, _)| format!("{}: [REDACTED]", k)))
            .finish()
    }
}

/// An active subscription that can be cancelled
pub trait SubscriptionHandle: Send {
    /// Destination the subscription listens on
    fn destination(&self) -> &str;

    /// Stop receiving frames
    fn unsubscribe(self: Box<Self>) -> Result<()>;
}

/// A live (or reconnecting) session with the broker
pub trait Session: Send + Sync {
    /// Register `handler` for frames arriving on `destination`
    fn subscribe(&self, destination: &str, handler: FrameHandler)
        -> Result<Box<dyn SubscriptionHandle>>;

    /// Close the session. Calling it again is a no-op.
    fn deactivate(&self);
}

/// A session together with its lifecycle event stream
pub struct Activation {
    pub session: Arc<dyn Session>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Opens sessions
pub trait Transport: Send + Sync {
    /// Start connecting. Failures are reported on the event stream.
    fn activate(&self, headers: ConnectHeaders) -> Activation;
}
