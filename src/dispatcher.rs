//! Inbound frame decoding and delivery
//!
//! Every decoded frame goes to the registered callback (if any) and to the
//! notification sink, whichever channel it arrived on. Frames that fail to
//! decode are logged and dropped.

use parking_lot::RwLock;
use serde::de::{Error as _, Unexpected};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{NotifyError, Result};

/// Category of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Personal,
    System,
    Public,
}

impl EventKind {
    fn from_channel(channel: Channel) -> Self {
        match channel {
            Channel::Personal => EventKind::Personal,
            Channel::System => EventKind::System,
            Channel::Public => EventKind::Public,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "personal" | "user" => Some(EventKind::Personal),
            "system" => Some(EventKind::System),
            "public" | "announcement" => Some(EventKind::Public),
            _ => None,
        }
    }
}

/// A decoded notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundEvent {
    pub title: String,
    pub body: String,
    pub kind: EventKind,
    /// Channel the frame arrived on
    pub channel: Channel,
    /// Server-assigned id, for read/unread bookkeeping by the consumer
    pub id: Option<String>,
    pub created_at: Option<String>,
    /// The payload as received
    pub payload: serde_json::Value,
}

/// Keys that may carry the notification text, in order of preference
const BODY_KEYS: [&str; 3] = ["body", "content", "message"];

/// Keys that may carry the notification kind
const KIND_KEYS: [&str; 2] = ["type", "kind"];

impl InboundEvent {
    /// Decode a frame body received on `channel`.
    ///
    /// The body must be a JSON object with a string `title`. Everything else
    /// is optional, and a field of an unexpected shape reads as absent.
    pub fn decode(channel: Channel, raw: &[u8]) -> Result<Self> {
        let payload: serde_json::Value = serde_json::from_slice(raw)?;
        let serde_json::Value::Object(fields) = &payload else {
            return Err(invalid_type(&payload, "a JSON object"));
        };

        let title = match fields.get("title") {
            Some(serde_json::Value::String(title)) => title.clone(),
            Some(other) => return Err(invalid_type(other, "a string title")),
            None => return Err(serde_json::Error::missing_field("title").into()),
        };

        let body = BODY_KEYS
            .iter()
            .find_map(|key| fields.get(*key).and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string();

        let kind = KIND_KEYS
            .iter()
            .filter_map(|key| fields.get(*key).and_then(|v| v.as_str()))
            .find_map(EventKind::parse)
            .unwrap_or_else(|| EventKind::from_channel(channel));

        let id = match fields.get("id") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let created_at = fields
            .get("createdAt")
            .or_else(|| fields.get("created_at"))
            .and_then(timestamp);

        Ok(Self {
            title,
            body,
            kind,
            channel,
            id,
            created_at,
            payload,
        })
    }
}

fn invalid_type(value: &serde_json::Value, expected: &str) -> NotifyError {
    let unexpected = match value {
        serde_json::Value::Null => Unexpected::Unit,
        serde_json::Value::Bool(b) => Unexpected::Bool(*b),
        serde_json::Value::Number(_) => Unexpected::Other("number"),
        serde_json::Value::String(s) => Unexpected::Str(s),
        serde_json::Value::Array(_) => Unexpected::Seq,
        serde_json::Value::Object(_) => Unexpected::Map,
    };
    serde_json::Error::invalid_type(unexpected, &expected).into()
}

/// Render a timestamp as text. Accepts a string, epoch number, or a
/// `[year, month, day, hour, minute, second, ..]` array.
fn timestamp(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Array(parts) => {
            let parts: Vec<u64> = parts.iter().map(|p| p.as_u64()).collect::<Option<_>>()?;
            match parts.as_slice() {
                [y, mo, d] => Some(format!("{:04}-{:02}-{:02}", y, mo, d)),
                [y, mo, d, h, mi] => {
                    Some(format!("{:04}-{:02}-{:02}T{:02}:{:02}", y, mo, d, h, mi))
                }
                [y, mo, d, h, mi, sec, ..] => Some(format!(
                    "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
                    y, mo, d, h, mi, sec
                )),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Consumer of decoded notifications
pub type NotificationCallback = Arc<dyn Fn(InboundEvent) + Send + Sync>;

/// User-visible surfacing of a notification (toast, banner, tray)
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, title: &str, body: &str) {
        info!(title, body, "Notification");
    }
}

/// Decodes inbound frames and hands them to the callback and the sink
pub struct Dispatcher {
    callback: RwLock<Option<NotificationCallback>>,
    sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            callback: RwLock::new(None),
            sink,
        }
    }

    /// Replace the callback. Only one is held; the last one set wins.
    pub fn set_callback(&self, callback: NotificationCallback) {
        if self.callback.write().replace(callback).is_some() {
            debug!("Replaced notification callback");
        }
    }

    /// Remove the callback
    pub fn clear_callback(&self) {
        self.callback.write().take();
    }

    /// Handle one frame body. Returns whether it decoded.
    pub fn on_frame(&self, channel: Channel, raw: &[u8]) -> bool {
        let event = match InboundEvent::decode(channel, raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(%channel, len = raw.len(), "Dropping undecodable frame: {}", e);
                return false;
            }
        };

        debug!(%channel, kind = ?event.kind, title = %event.title, "Dispatching notification");

        let callback = self.callback.read().clone();
        let (title, body) = (event.title.clone(), event.body.clone());
        if let Some(callback) = callback {
            callback(event);
        }
        self.sink.notify(&title, &body);

        true
    }
}
