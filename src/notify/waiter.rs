//! Per-appointment waiter tasks.
//!
//! Each scheduled appointment gets one cooperative tokio task that sleeps
//! through its message sequence in fire-time order. Waits are chunked so a
//! yearly recurrence never relies on a single multi-month sleep, and
//! cancellation is re-checked between chunks, before each wait, and before
//! each delivery.

use super::{DestinationResolver, Localizer, MessageKind, NotificationSink, ScheduledMessage};
use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Longest single sleep before remaining time and cancellation are
/// re-evaluated.
const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(24 * 60 * 60);

/// Callback type invoked after the deadline message of a sequence fires.
///
/// Never invoked for a cancelled waiter.
pub type CompletionAction = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation handle for one live waiter.
#[derive(Debug)]
pub struct WaiterHandle {
    token: CancellationToken,
}

impl WaiterHandle {
    /// Abort the remaining sequence. Safe to call while the waiter is
    /// mid-wait or mid-delivery; nothing further is delivered.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once [`WaiterHandle::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Schedules cancellable notification sequences on the shared runtime.
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    localizer: Arc<dyn Localizer>,
    resolver: Arc<dyn DestinationResolver>,
    clock: Arc<dyn Clock>,
    tracker: TaskTracker,
    max_sleep_chunk: Duration,
}

impl Notifier {
    /// Create a notifier over the given delivery collaborators.
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        localizer: Arc<dyn Localizer>,
        resolver: Arc<dyn DestinationResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sink,
            localizer,
            resolver,
            clock,
            tracker: TaskTracker::new(),
            max_sleep_chunk: MAX_SLEEP_CHUNK,
        }
    }

    /// Override the maximum single-sleep chunk.
    pub fn with_max_sleep_chunk(mut self, chunk: Duration) -> Self {
        self.max_sleep_chunk = chunk.max(Duration::from_millis(1));
        self
    }

    /// Start a waiter for `messages`, delivered to `community`'s channel in
    /// ascending fire-time order. `on_complete` runs after the final
    /// message unless the waiter is cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(
        &self,
        community: &str,
        mut messages: Vec<ScheduledMessage>,
        on_complete: CompletionAction,
    ) -> WaiterHandle {
        messages.sort_by_key(|m| m.fire_at);
        let token = CancellationToken::new();

        let task = SequenceTask {
            sink: Arc::clone(&self.sink),
            localizer: Arc::clone(&self.localizer),
            resolver: Arc::clone(&self.resolver),
            clock: Arc::clone(&self.clock),
            community: community.to_owned(),
            token: token.clone(),
            max_sleep_chunk: self.max_sleep_chunk,
        };
        self.tracker.spawn(task.run(messages, on_complete));

        WaiterHandle { token }
    }

    /// Wait for every spawned waiter to finish. Terminal: no further
    /// sequences should be scheduled afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// State shared by one waiter task.
struct SequenceTask {
    sink: Arc<dyn NotificationSink>,
    localizer: Arc<dyn Localizer>,
    resolver: Arc<dyn DestinationResolver>,
    clock: Arc<dyn Clock>,
    community: String,
    token: CancellationToken,
    max_sleep_chunk: Duration,
}

impl SequenceTask {
    async fn run(self, messages: Vec<ScheduledMessage>, on_complete: CompletionAction) {
        for message in messages {
            if self.token.is_cancelled() {
                debug!("waiter for {} cancelled, dropping sequence", self.community);
                return;
            }

            let now = self.clock.now_utc();
            if message.fire_at <= now {
                if message.kind == MessageKind::Reminder {
                    // Overdue reminders carry no value and must not flood
                    // the channel after restart recovery.
                    debug!(
                        "skipping overdue reminder for {} (was due {})",
                        self.community, message.fire_at
                    );
                    continue;
                }
            } else if self.wait_until(message.fire_at).await {
                debug!("waiter for {} cancelled mid-wait", self.community);
                return;
            }

            if self.token.is_cancelled() {
                return;
            }
            self.deliver(&message).await;
        }

        if self.token.is_cancelled() {
            return;
        }
        on_complete();
    }

    /// Sleep until `fire_at` in bounded chunks. Returns `true` when the
    /// waiter was cancelled during the wait.
    async fn wait_until(&self, fire_at: chrono::DateTime<chrono::Utc>) -> bool {
        loop {
            let now = self.clock.now_utc();
            let Ok(remaining) = (fire_at - now).to_std() else {
                return false;
            };
            if remaining.is_zero() {
                return false;
            }

            let chunk = remaining.min(self.max_sleep_chunk);
            tokio::select! {
                _ = self.token.cancelled() => return true,
                _ = tokio::time::sleep(chunk) => {}
            }
        }
    }

    /// Best-effort delivery of one message; failures are logged and the
    /// sequence continues.
    async fn deliver(&self, message: &ScheduledMessage) {
        let Some(channel) = self.resolver.resolve(&self.community) else {
            warn!(
                "no notification channel configured for {}, dropping '{}'",
                self.community, message.key
            );
            return;
        };

        let rendered = self.localizer.render(&message.key, &message.context);
        if let Err(e) = self.sink.deliver(&channel, &rendered).await {
            warn!("cannot deliver '{}' to {channel}: {e}", message.key);
        }
    }
}
