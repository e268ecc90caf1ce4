//! # Event Bus System
//!
//! Typed event stream for the household sync core, built on `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: [`CoreEvent`] wrapping [`SyncEvent`] (engine lifecycle,
//!   connectivity, conflicts) and [`QueueEvent`] (local queue activity)
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//! - **Listeners**: Callback subscriptions returning an unsubscribe handle
//!
//! ## Delivery guarantees
//!
//! - Every subscriber sees events in emission order.
//! - Events are not buffered for late subscribers: a receiver only sees
//!   events emitted after it subscribed (at-most-once, no replay).
//! - A subscriber that falls more than `capacity` events behind receives
//!   `RecvError::Lagged(n)` and continues with newer events. Observers treat
//!   this as "my cached counts may be stale" and poll.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Sync(SyncEvent::Online)).ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event, CoreEvent::Sync(SyncEvent::Online));
//! # }
//! ```
//!
//! Payloads of financial records never travel on the bus; events carry
//! identifiers and versions only; details are read from the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Engine lifecycle, connectivity and conflict events
    Sync(SyncEvent),
    /// Local change queue activity
    Queue(QueueEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Queue(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::SyncError { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::ConflictDetected { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Offline) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::SyncComplete { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::Online) => EventSeverity::Info,
            CoreEvent::Queue(QueueEvent::ConflictResolved { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Whether observers holding cached queue counts should refresh them.
    ///
    /// Every event that follows a queue or state mutation qualifies; only the
    /// advisory `RemoteUpdate` does not.
    pub fn invalidates_status(&self) -> bool {
        !matches!(self, CoreEvent::Sync(SyncEvent::RemoteUpdate { .. }))
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events emitted by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Connectivity lost; no drain runs until it returns.
    Offline,
    /// Connectivity restored; a drain follows.
    Online,
    /// A drain pass started.
    SyncStart {
        /// Identifier of this drain pass.
        run_id: String,
        /// Entries pending when the pass started.
        pending: u64,
    },
    /// A drain pass finished without unresolved failures.
    SyncComplete {
        run_id: String,
        /// When the pass finished.
        timestamp: DateTime<Utc>,
        /// Entries confirmed by the remote store in this pass.
        synced: u64,
        /// Entries moved to `conflict` in this pass.
        conflicts: u64,
    },
    /// An entry failed permanently, or a drain ended with failures.
    SyncError {
        /// Pass that produced the error, when known.
        run_id: Option<String>,
        /// Affected queue entry for entry-level failures.
        change_id: Option<i64>,
        /// Human-readable error message.
        message: String,
        /// Whether a later retry may succeed.
        recoverable: bool,
    },
    /// A queued mutation conflicts with a concurrent remote write.
    ConflictDetected {
        change_id: i64,
        entity_type: String,
        entity_id: String,
        /// The base version the local edit was made against.
        local_version: Option<u64>,
        /// The version currently on the server (0 when absent).
        remote_version: u64,
    },
    /// Another writer changed a record on the server. Advisory only.
    RemoteUpdate {
        household_id: String,
        entity_type: String,
        entity_id: String,
        version: u64,
        deleted: bool,
    },
    /// The engine's externally observed state changed.
    StateChanged { from: String, to: String },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Offline => "Connectivity lost",
            SyncEvent::Online => "Connectivity restored",
            SyncEvent::SyncStart { .. } => "Sync started",
            SyncEvent::SyncComplete { .. } => "Sync completed successfully",
            SyncEvent::SyncError { .. } => "Sync error",
            SyncEvent::ConflictDetected { .. } => "Conflict detected",
            SyncEvent::RemoteUpdate { .. } => "Remote record updated",
            SyncEvent::StateChanged { .. } => "Sync state changed",
        }
    }
}

// ============================================================================
// Queue Events
// ============================================================================

/// Events describing local change queue activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A local mutation was queued, possibly merged into an outstanding entry.
    ChangeQueued {
        change_id: i64,
        entity_type: String,
        entity_id: String,
        operation: String,
        /// True when merged into an existing outstanding entry.
        coalesced: bool,
    },
    /// A conflict was resolved manually.
    ConflictResolved {
        change_id: i64,
        use_remote: bool,
        /// Fresh entry created when the local payload was kept.
        requeued_change_id: Option<i64>,
    },
    /// A failed entry was returned to `pending` by the user.
    FailedRetried { change_id: i64 },
}

impl QueueEvent {
    fn description(&self) -> &str {
        match self {
            QueueEvent::ChangeQueued { .. } => "Change queued",
            QueueEvent::ConflictResolved { .. } => "Conflict resolved",
            QueueEvent::FailedRetried { .. } => "Failed change retried",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   Zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are no active subscribers. Emitters that do not care
    /// whether anyone listens call `.ok()` on the result.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Registers a callback invoked for every subsequent event.
    ///
    /// The receiver is created before this returns, so no event emitted
    /// after the call is missed. Callbacks run on a dedicated task in
    /// emission order. Lagging is logged and delivery continues.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_listener<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(CoreEvent) + Send + Sync + 'static,
    {
        let mut receiver = self.subscribe();
        let handler = Arc::new(handler);

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event listener lagged; some events were dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        ListenerHandle { task }
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::add_listener`].
///
/// Dropping the handle leaves the listener running; call
/// [`unsubscribe`](ListenerHandle::unsubscribe) to stop it.
#[must_use = "dropping the handle keeps the listener alive with no way to stop it"]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stops delivering events to the listener.
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let bus = EventBus::new(100);
/// let conflicts = EventStream::new(bus.subscribe()).filter(|event| {
///     matches!(event, CoreEvent::Sync(core_runtime::events::SyncEvent::ConflictDetected { .. }))
/// });
/// # drop(conflicts);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
