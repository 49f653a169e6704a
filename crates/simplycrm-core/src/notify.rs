//! In-process notification bus.
//!
//! The API client publishes user-facing events here (session expiry,
//! throttling). Whatever renders them, a toast layer or the CLI, subscribes.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;

/// Notifications buffered per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Assigned on publish.
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn session_expired() -> Self {
        Self::new(
            NotificationKind::Warning,
            "Session expired",
            "Please sign in again to continue.",
        )
    }

    pub fn throttled(retry_after: Option<u64>) -> Self {
        let message = match retry_after {
            Some(secs) => format!("Retry the request in {} s.", secs),
            None => "Request limit reached. Please try again later.".to_string(),
        };
        Self::new(NotificationKind::Info, "Temporary delay", message)
    }
}

/// Cheap to clone; clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Publish to every current subscriber and return how many received it.
    pub fn publish(&self, mut notification: Notification) -> usize {
        notification.id = new_id();
        // `send` only fails when nobody is subscribed.
        self.sender.send(notification).unwrap_or(0)
    }
}

fn new_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
