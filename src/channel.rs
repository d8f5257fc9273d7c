//! Logical notification channels

use serde::Serialize;
use std::fmt;

use crate::credentials::Identity;

/// One of the fixed channels every connection subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Queue addressed to the signed-in user
    Personal,
    /// Platform-wide operational notices
    System,
    /// Public announcements
    Public,
}

impl Channel {
    /// Every channel, in attach order
    pub const ALL: [Channel; 3] = [Channel::Personal, Channel::System, Channel::Public];

    /// Short registry name
    pub fn name(self) -> &'static str {
        match self {
            Channel::Personal => "personal",
            Channel::System => "system",
            Channel::Public => "public",
        }
    }

    /// Broker destination for this channel
    pub fn destination(self, identity: &Identity) -> String {
        match self {
            Channel::Personal => format!("/user/{}/queue/notifications", identity),
            Channel::System => "/topic/system".to_string(),
            Channel::Public => "/topic/public".to_string(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
