//! Notification delivery.
//!
//! The engine hands the [`Notifier`] an ordered list of scheduled messages
//! per appointment; the notifier owns the background waits and pushes each
//! rendered message to the chat platform through the boundary traits below.

mod waiter;

pub use waiter::{CompletionAction, Notifier, WaiterHandle};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Localization key for the per-offset reminder message.
pub const MSG_REMINDER: &str = "appointment-reminder";

/// Localization key for the deadline message.
pub const MSG_DUE: &str = "appointment-due";

/// A notification could not be handed to the chat platform.
#[derive(Debug, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Pushes one rendered message to a destination channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `message` to `channel`. Failures are logged by the waiter
    /// and never abort the remaining sequence.
    async fn deliver(&self, channel: &str, message: &str) -> Result<(), DeliveryError>;
}

/// Renders a message key plus key/value context into user-facing text.
pub trait Localizer: Send + Sync {
    /// Render `key` with `context` pairs.
    fn render(&self, key: &str, context: &[(String, String)]) -> String;
}

/// Maps a community to its notification channel.
pub trait DestinationResolver: Send + Sync {
    /// The channel to deliver to, or `None` when the community has no
    /// channel configured (delivery becomes a logged no-op).
    fn resolve(&self, community: &str) -> Option<String>;
}

/// Whether a scheduled message is a reminder or the deadline itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Advance reminder; skipped when already overdue at evaluation time.
    Reminder,
    /// The deadline entry; always delivered (the engine never arms a
    /// deadline that is already in the past).
    Deadline,
}

/// One entry of an appointment's notification sequence.
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    /// UTC instant the message fires at.
    pub fire_at: DateTime<Utc>,
    /// Reminder or deadline.
    pub kind: MessageKind,
    /// Localization key.
    pub key: String,
    /// Key/value pairs handed to the localizer.
    pub context: Vec<(String, String)>,
}

/// Human-readable rendering of a reminder offset ("2 hours", "30 minutes",
/// "3 days") for the message context.
pub fn format_offset(offset: Duration) -> String {
    let minutes = offset.num_minutes().max(1);
    if minutes % (24 * 60) == 0 {
        let days = minutes / (24 * 60);
        if days == 1 {
            "1 day".to_owned()
        } else {
            format!("{days} days")
        }
    } else if minutes % 60 == 0 {
        let hours = minutes / 60;
        if hours == 1 {
            "1 hour".to_owned()
        } else {
            format!("{hours} hours")
        }
    } else if minutes == 1 {
        "1 minute".to_owned()
    } else {
        format!("{minutes} minutes")
    }
}
