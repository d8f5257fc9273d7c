//! edunotify - real-time notification client
//!
//! Keeps one authenticated STOMP-over-WebSocket session to the classroom
//! backend, subscribes the signed-in user's personal queue plus the system and
//! public topics, and hands every decoded notification to a single callback.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use edunotify::{FileStore, NotificationClient, NotifyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NotifyConfig::new("wss://api.example.com/ws");
//!     let store = Arc::new(FileStore::new("storage.json"));
//!     let client = NotificationClient::stomp(config, store);
//!
//!     client.set_notification_callback(|event| {
//!         println!("[{:?}] {}: {}", event.kind, event.title, event.body);
//!     });
//!
//!     client.connect().await?;
//!
//!     // ... on sign-out
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

mod channel;
mod client;
mod config;
mod credentials;
mod dispatcher;
mod error;
pub mod frame;
mod registry;
pub mod transport;

pub use channel::Channel;
pub use client::{ConnectionState, NotificationClient};
pub use config::{NotifyConfig, DEFAULT_TOKEN_KEY};
pub use credentials::{
    identity_from_token, Credential, CredentialResolver, CredentialStore, FileStore, Identity,
    MemoryStore,
};
pub use dispatcher::{
    Dispatcher, EventKind, InboundEvent, LogSink, NotificationCallback, NotificationSink,
};
pub use error::{NotifyError, Result};
pub use registry::SubscriptionRegistry;
pub use transport::stomp::StompTransport;
