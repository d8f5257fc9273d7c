//! Subscription registry
//!
//! Holds at most one subscription handle per [`Channel`]. Handles belong to
//! the connection they were made on and are dropped from here when it ends.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::client::ConnectionState;
use crate::credentials::Identity;
use crate::dispatcher::Dispatcher;
use crate::error::{NotifyError, Result};
use crate::transport::{FrameHandler, Session, SubscriptionHandle};

pub struct SubscriptionRegistry {
    handles: Mutex<BTreeMap<Channel, Box<dyn SubscriptionHandle>>>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: Arc<Dispatcher>,
}

impl SubscriptionRegistry {
    pub fn new(state: watch::Receiver<ConnectionState>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            handles: Mutex::new(BTreeMap::new()),
            state,
            dispatcher,
        }
    }

    /// Subscribe every channel that has no handle yet.
    ///
    /// Refuses with `NotConnected` unless the connection is up. Returns the
    /// number of channels newly attached; a failure on one channel is logged
    /// and does not stop the others.
    pub fn attach_all(&self, session: &dyn Session, identity: &Identity) -> Result<usize> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(NotifyError::NotConnected);
        }

        let mut attached = 0;
        for channel in Channel::ALL {
            if self.handles.lock().contains_key(&channel) {
                debug!(%channel, "Already subscribed");
                continue;
            }

            let destination = channel.destination(identity);
            let dispatcher = self.dispatcher.clone();
            let handler: FrameHandler = Arc::new(move |raw| {
                dispatcher.on_frame(channel, raw);
            });

            let handle = match session.subscribe(&destination, handler) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(%channel, %destination, "Failed to subscribe: {}", e);
                    continue;
                }
            };

            if self.insert(channel, handle) {
                attached += 1;
            }
        }

        info!(attached, total = self.len(), "Channels attached");
        Ok(attached)
    }

    /// Keep `handle` unless the channel already has one, in which case the
    /// new handle is unsubscribed and the existing one kept.
    fn insert(&self, channel: Channel, handle: Box<dyn SubscriptionHandle>) -> bool {
        let duplicate = {
            let mut handles = self.handles.lock();
            if handles.contains_key(&channel) {
                Some(handle)
            } else {
                handles.insert(channel, handle);
                None
            }
        };

        match duplicate {
            Some(handle) => {
                debug!(%channel, "Disposing duplicate subscription");
                if let Err(e) = handle.unsubscribe() {
                    warn!(%channel, "Failed to dispose duplicate subscription: {}", e);
                }
                false
            }
            None => true,
        }
    }

    /// Unsubscribe and forget every handle. Failures are logged and skipped.
    /// Returns the number of handles removed.
    pub fn detach_all(&self) -> usize {
        let handles = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();

        for (channel, handle) in handles {
            let destination = handle.destination().to_string();
            match handle.unsubscribe() {
                Ok(()) => debug!(%channel, %destination, "Unsubscribed"),
                Err(e) => warn!(%channel, %destination, "Failed to unsubscribe: {}", e),
            }
        }

        count
    }

    /// Forget every handle without unsubscribing. Used when the connection
    /// they were made on is already gone.
    pub fn discard_all(&self) -> usize {
        let handles = std::mem::take(&mut *self.handles.lock());
        handles.len()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.handles.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}
