//! Event queue and delivery pipeline.
//!
//! The [`QueueManager`] buffers tab activity events and delivers them to the
//! backend in batches:
//!
//! - Events are appended in arrival order and persisted after every change
//! - The queue is bounded; when full, the oldest 10% of capacity is evicted
//! - A fixed-interval timer flushes up to `batch_size` of the oldest events
//! - Reaching `batch_size` queued events triggers an early flush
//! - A failed flush puts the batch back at the front and retries after
//!   `retry_delay`
//! - After `max_failures_before_disable` consecutive failures, timers are
//!   cancelled and tracking is switched off through the [`TrackingSwitch`]
//!
//! Only one flush runs at a time. The state lock is never held across an
//! await point; events added while a batch is in flight are appended behind
//! it, and a failed batch is restored ahead of them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabpulse_agent::queue::{QueueConfig, QueueManager};
//! use tabpulse_agent::settings::SharedSettings;
//! use tabpulse_agent::storage::Storage;
//! use tabpulse_agent::types::EventType;
//! # use tabpulse_agent::queue::EventSink;
//! # fn sink() -> Arc<dyn EventSink> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = Storage::open("/tmp/tabpulse").unwrap();
//!     let settings = SharedSettings::load(storage.clone()).unwrap();
//!     let queue = QueueManager::new(
//!         QueueConfig::default(),
//!         sink(),
//!         storage,
//!         settings.clone(),
//!         Arc::new(settings),
//!     );
//!
//!     queue.restore().unwrap();
//!     queue.start();
//!     queue.add_event(EventType::Active, "example.com");
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::client::ClientError;
use crate::domain::ExclusionList;
use crate::settings::SharedSettings;
use crate::storage::{Storage, StorageError, QUEUE_KEY};
use crate::types::{Event, EventType};

/// Default number of events sent per flush.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default interval between periodic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay before retrying a failed flush.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Default queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Default number of consecutive failures before tracking is disabled.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Reason recorded when a flush is attempted while offline.
const OFFLINE_REASON: &str = "offline";

/// Destination for event batches.
pub trait EventSink: Send + Sync {
    /// Delivers a batch. Any error counts as a failed flush.
    fn send_events<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), ClientError>>;
}

/// Turns tracking off when delivery keeps failing.
pub trait TrackingSwitch: Send + Sync {
    /// Disables tracking. The queue calls this at most once per failure streak.
    fn disable_tracking(&self, reason: &str);
}

/// Tuning for the queue manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum events per flush; reaching it triggers an early flush.
    pub batch_size: usize,

    /// Interval of the periodic flush timer.
    pub flush_interval: Duration,

    /// Delay before retrying after a failed flush.
    pub retry_delay: Duration,

    /// Capacity of the queue.
    pub max_queue_size: usize,

    /// Consecutive failures that switch tracking off.
    pub max_failures_before_disable: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_failures_before_disable: DEFAULT_MAX_FAILURES,
        }
    }
}

impl QueueConfig {
    /// Number of events evicted at once when the queue is full.
    #[must_use]
    pub fn eviction_count(&self) -> usize {
        (self.max_queue_size / 10).max(1)
    }
}

/// Result of [`QueueManager::add_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The event was appended.
    Queued,

    /// The event was appended after evicting the oldest events.
    QueuedWithEviction { evicted: usize },

    /// The domain is excluded; nothing was queued.
    Excluded,
}

/// Result of a flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to send.
    Empty,

    /// Another flush is already running.
    InProgress,

    /// A batch was delivered and removed from the queue.
    Delivered { count: usize },

    /// No session to deliver with. The batch is back in the queue and no
    /// failure is counted; delivery resumes after login.
    AwaitingLogin { queued: usize },

    /// Delivery failed; the batch is back at the front of the queue.
    Failed {
        reason: String,
        consecutive_failures: u32,
        /// `None` once the failure threshold has been reached.
        retry_in: Option<Duration>,
    },
}

/// Snapshot of queue health for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub consecutive_failures: u32,
    pub max_failures_before_disable: u32,
    pub online: bool,
    pub flushing: bool,
    pub awaiting_login: bool,
    pub retry_pending: bool,
    pub timer_running: bool,
    pub disabled_by_failures: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_delivered: u64,
    pub total_evicted: u64,
    pub total_excluded: u64,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<Event>,
    consecutive_failures: u32,
    online: bool,
    flushing: bool,
    awaiting_login: bool,
    early_flush_requested: bool,
    disabled_by_failures: bool,
    timer: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    total_delivered: u64,
    total_evicted: u64,
    total_excluded: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            consecutive_failures: 0,
            online: true,
            flushing: false,
            awaiting_login: false,
            early_flush_requested: false,
            disabled_by_failures: false,
            timer: None,
            retry: None,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            total_delivered: 0,
            total_evicted: 0,
            total_excluded: 0,
        }
    }

    /// Drops every queued event whose domain is excluded.
    fn purge(&mut self, exclusions: &ExclusionList) -> usize {
        if exclusions.is_empty() {
            return 0;
        }
        let before = self.events.len();
        self.events.retain(|e| !exclusions.is_excluded(&e.domain));
        let removed = before - self.events.len();
        self.total_excluded += removed as u64;
        removed
    }

    /// Puts an undelivered batch back ahead of newer events, keeping order.
    fn restore_front(&mut self, batch: Vec<Event>, max_queue_size: usize) {
        for event in batch.into_iter().rev() {
            self.events.push_front(event);
        }
        let overflow = self.events.len().saturating_sub(max_queue_size);
        if overflow > 0 {
            self.events.drain(..overflow);
            self.total_evicted += overflow as u64;
            warn!(evicted = overflow, "Queue over capacity after failed flush, oldest events evicted");
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.cancel_retry();
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }
}

struct QueueInner {
    config: QueueConfig,
    sink: Arc<dyn EventSink>,
    storage: Storage,
    settings: SharedSettings,
    switch: Arc<dyn TrackingSwitch>,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &QueueState) {
        if let Err(e) = self.storage.set(QUEUE_KEY, &state.events) {
            warn!(error = %e, queued = state.events.len(), "Failed to persist event queue");
        }
    }
}

/// Restores an in-flight batch if the flush future is dropped before the
/// delivery result is handled (e.g. on shutdown timeout).
struct InFlightBatch<'a> {
    inner: &'a QueueInner,
    events: Option<Vec<Event>>,
}

impl InFlightBatch<'_> {
    fn take(&mut self) -> Vec<Event> {
        self.events.take().unwrap_or_default()
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            let mut state = self.inner.lock();
            state.flushing = false;
            state.restore_front(events, self.inner.config.max_queue_size);
            self.inner.persist(&state);
            debug!("In-flight batch returned to queue");
        }
    }
}

/// Buffers events and delivers them reliably to an [`EventSink`].
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.inner.config)
            .field("queued", &self.len())
            .finish()
    }
}

impl QueueManager {
    /// Creates an empty queue. Call [`restore`](Self::restore) to load
    /// persisted events and [`start`](Self::start) to arm the flush timer.
    #[must_use]
    pub fn new(
        config: QueueConfig,
        sink: Arc<dyn EventSink>,
        storage: Storage,
        settings: SharedSettings,
        switch: Arc<dyn TrackingSwitch>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                sink,
                storage,
                settings,
                switch,
                state: Mutex::new(QueueState::new()),
            }),
        }
    }

    fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self { inner }
    }

    /// Returns the queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Loads persisted events, dropping excluded ones and trimming to capacity.
    ///
    /// Returns the number of events restored. A corrupt queue document is
    /// discarded with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error for I/O failures while reading the document.
    pub fn restore(&self) -> Result<usize, StorageError> {
        let stored: Vec<Event> = match self.inner.storage.get(QUEUE_KEY) {
            Ok(events) => events.unwrap_or_default(),
            Err(StorageError::Corrupt { source, .. }) => {
                warn!(error = %source, "Persisted queue is corrupt, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let exclusions = self.inner.settings.exclusions();
        let mut state = self.inner.lock();
        state.events = stored.into();
        state.purge(&exclusions);

        let max = self.inner.config.max_queue_size;
        let overflow = state.events.len().saturating_sub(max);
        if overflow > 0 {
            state.events.drain(..overflow);
            state.total_evicted += overflow as u64;
        }
        self.inner.persist(&state);

        let restored = state.events.len();
        info!(restored, "Event queue restored");
        Ok(restored)
    }

    /// Appends an event for `domain` unless it is excluded.
    ///
    /// When the queue is full, the oldest events are evicted first. Reaching
    /// `batch_size` queued events triggers an immediate flush.
    pub fn add_event(&self, event_type: EventType, domain: impl Into<String>) -> AddOutcome {
        let domain = domain.into();
        if self.inner.settings.is_excluded(&domain) {
            trace!(domain = %domain, "Ignoring event for excluded domain");
            return AddOutcome::Excluded;
        }

        let event = Event::new(event_type, domain);
        let config = &self.inner.config;

        let (outcome, flush_now) = {
            let mut state = self.inner.lock();

            let mut evicted = 0;
            if state.events.len() >= config.max_queue_size {
                evicted = config.eviction_count().min(state.events.len());
                state.events.drain(..evicted);
                state.total_evicted += evicted as u64;
                warn!(evicted, "Event queue full, oldest events evicted");
            }

            trace!(
                event_type = %event.event_type,
                domain = %event.domain,
                "Event queued"
            );
            state.events.push_back(event);
            self.inner.persist(&state);

            let flush_now = state.events.len() >= config.batch_size
                && !state.flushing
                && !state.awaiting_login
                && !state.early_flush_requested;
            if flush_now {
                state.early_flush_requested = true;
            }

            let outcome = if evicted > 0 {
                AddOutcome::QueuedWithEviction { evicted }
            } else {
                AddOutcome::Queued
            };
            (outcome, flush_now)
        };

        if flush_now {
            debug!(batch_size = config.batch_size, "Batch size reached, flushing early");
            self.spawn_flush();
        }

        outcome
    }

    /// Attempts to deliver up to `batch_size` of the oldest events.
    pub async fn flush(&self) -> FlushOutcome {
        let inner = &*self.inner;
        let exclusions = inner.settings.exclusions();

        let mut in_flight = {
            let mut state = inner.lock();
            state.early_flush_requested = false;

            if state.flushing {
                trace!("Flush already in progress");
                return FlushOutcome::InProgress;
            }

            let purged = state.purge(&exclusions);
            if purged > 0 {
                debug!(purged, "Dropped queued events for excluded domains");
                inner.persist(&state);
            }

            if state.events.is_empty() {
                return FlushOutcome::Empty;
            }

            if state.awaiting_login {
                trace!("No session, flush skipped");
                return FlushOutcome::AwaitingLogin {
                    queued: state.events.len(),
                };
            }

            if !state.online {
                debug!(queued = state.events.len(), "Offline, flush counted as failed");
                let (outcome, disable) = self.register_failure(&mut state, OFFLINE_REASON, None);
                drop(state);
                self.maybe_disable(disable);
                return outcome;
            }

            let count = inner.config.batch_size.min(state.events.len());
            let batch: Vec<Event> = state.events.drain(..count).collect();
            state.flushing = true;
            InFlightBatch {
                inner,
                events: Some(batch),
            }
        };

        let count = in_flight.events.as_ref().map_or(0, Vec::len);
        debug!(events = count, "Flushing event batch");

        let result = match in_flight.events.as_deref() {
            Some(batch) => inner.sink.send_events(batch).await,
            None => Ok(()),
        };

        let batch = in_flight.take();
        let mut state = inner.lock();
        state.flushing = false;

        match result {
            Ok(()) => {
                state.consecutive_failures = 0;
                state.awaiting_login = false;
                state.total_delivered += count as u64;
                state.last_success_at = Some(Utc::now());
                state.last_error = None;
                state.cancel_retry();
                inner.persist(&state);
                info!(
                    events = count,
                    remaining = state.events.len(),
                    "Events delivered"
                );
                FlushOutcome::Delivered { count }
            }
            Err(ClientError::NotAuthenticated) => {
                state.restore_front(batch, inner.config.max_queue_size);
                state.awaiting_login = true;
                state.cancel_retry();
                inner.persist(&state);
                debug!(queued = state.events.len(), "No session, holding events until login");
                FlushOutcome::AwaitingLogin {
                    queued: state.events.len(),
                }
            }
            Err(e) => {
                warn!(error = %e, events = count, "Event delivery failed");
                state.restore_front(batch, inner.config.max_queue_size);
                let reason = e.to_string();
                let (outcome, disable) =
                    self.register_failure(&mut state, &reason, e.retry_after());
                drop(state);
                self.maybe_disable(disable);
                outcome
            }
        }
    }

    /// Records a failed flush and schedules a retry or hits the threshold.
    ///
    /// Returns the outcome and whether the tracking switch must be invoked.
    fn register_failure(
        &self,
        state: &mut QueueState,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> (FlushOutcome, bool) {
        let config = &self.inner.config;

        state.consecutive_failures += 1;
        state.last_failure_at = Some(Utc::now());
        state.last_error = Some(reason.to_string());
        self.inner.persist(state);

        let failures = state.consecutive_failures;

        if failures >= config.max_failures_before_disable {
            state.cancel_timers();
            let first = !state.disabled_by_failures;
            state.disabled_by_failures = true;
            if first {
                warn!(
                    consecutive_failures = failures,
                    queued = state.events.len(),
                    "Failure threshold reached, stopping delivery"
                );
            }
            let outcome = FlushOutcome::Failed {
                reason: reason.to_string(),
                consecutive_failures: failures,
                retry_in: None,
            };
            return (outcome, first);
        }

        let delay = retry_after.map_or(config.retry_delay, |d| d.max(config.retry_delay));
        self.schedule_retry(state, delay);
        info!(
            consecutive_failures = failures,
            retry_in_secs = delay.as_secs(),
            "Flush failed, retry scheduled"
        );

        let outcome = FlushOutcome::Failed {
            reason: reason.to_string(),
            consecutive_failures: failures,
            retry_in: Some(delay),
        };
        (outcome, false)
    }

    fn maybe_disable(&self, disable: bool) {
        if disable {
            let reason = format!(
                "{} consecutive delivery failures",
                self.inner.config.max_failures_before_disable
            );
            self.inner.switch.disable_tracking(&reason);
        }
    }

    fn schedule_retry(&self, state: &mut QueueState, delay: Duration) {
        state.cancel_retry();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, retry not scheduled");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        state.retry = Some(handle.spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                debug!("Retrying failed flush");
                QueueManager::from_inner(inner).flush().await;
            }
        }));
    }

    /// Runs a flush on a background task.
    fn spawn_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, early flush skipped");
            return;
        };
        let queue = self.clone();
        handle.spawn(async move {
            queue.flush().await;
        });
    }

    /// Arms the periodic flush timer. Does nothing if it is already running.
    pub fn start(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, flush timer not started");
            return;
        };

        let mut state = self.inner.lock();
        if state.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let period = self.inner.config.flush_interval;
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        state.timer = Some(handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                trace!("Periodic flush");
                QueueManager::from_inner(inner).flush().await;
            }
        }));
        debug!(interval_secs = period.as_secs(), "Flush timer started");
    }

    /// Cancels the periodic timer and any pending retry.
    pub fn stop(&self) {
        self.inner.lock().cancel_timers();
        debug!("Flush timers stopped");
    }

    /// Clears the failure streak and re-arms the timer after tracking is
    /// switched back on.
    pub fn resume(&self) {
        {
            let mut state = self.inner.lock();
            state.consecutive_failures = 0;
            state.awaiting_login = false;
            state.disabled_by_failures = false;
            state.last_error = None;
        }
        info!("Event delivery resumed");
        self.start();
    }

    /// Updates connectivity. Going from offline to online with pending events
    /// triggers one immediate flush attempt.
    ///
    /// Returns `true` if a flush was triggered.
    pub fn set_online_status(&self, online: bool) -> bool {
        let trigger = {
            let mut state = self.inner.lock();
            let was_online = state.online;
            state.online = online;
            if was_online != online {
                info!(online, queued = state.events.len(), "Connectivity changed");
            }
            !was_online && online && !state.events.is_empty() && !state.awaiting_login
        };

        if trigger {
            self.spawn_flush();
        }
        trigger
    }

    /// Removes queued events whose domains are currently excluded and
    /// persists the queue. Returns the number removed.
    pub fn apply_exclusions(&self) -> usize {
        let exclusions = self.inner.settings.exclusions();
        self.purge_with(&exclusions)
    }

    /// Removes queued events for `domain` and its subdomains.
    pub fn purge_domain(&self, domain: &str) -> usize {
        let mut single = ExclusionList::new();
        single.insert(domain.to_string());
        self.purge_with(&single)
    }

    fn purge_with(&self, exclusions: &ExclusionList) -> usize {
        let mut state = self.inner.lock();
        let removed = state.purge(exclusions);
        if removed > 0 {
            self.inner.persist(&state);
            info!(removed, remaining = state.events.len(), "Purged excluded events from queue");
        }
        removed
    }

    /// Stops the timers and makes a bounded final delivery attempt.
    ///
    /// Returns the number of events left undelivered (they stay persisted).
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.stop();

        if self.is_empty() {
            return 0;
        }

        info!(queued = self.len(), "Flushing queue before shutdown");

        let drain = async {
            loop {
                match self.flush().await {
                    FlushOutcome::Delivered { .. } if !self.is_empty() => continue,
                    _ => break,
                }
            }
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("Timed out flushing queue during shutdown");
        }

        // A failed final flush may have scheduled a retry.
        self.stop();

        let remaining = self.len();
        self.inner.persist(&self.inner.lock());
        remaining
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Returns true if no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Copy of the queued events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// Current count of consecutive failed flushes.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Snapshot of queue health.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let config = &self.inner.config;
        let state = self.inner.lock();
        QueueStats {
            queued: state.events.len(),
            max_queue_size: config.max_queue_size,
            batch_size: config.batch_size,
            consecutive_failures: state.consecutive_failures,
            max_failures_before_disable: config.max_failures_before_disable,
            online: state.online,
            flushing: state.flushing,
            awaiting_login: state.awaiting_login,
            retry_pending: state.retry.as_ref().is_some_and(|h| !h.is_finished()),
            timer_running: state.timer.as_ref().is_some_and(|h| !h.is_finished()),
            disabled_by_failures: state.disabled_by_failures,
            last_success_at: state.last_success_at,
            last_failure_at: state.last_failure_at,
            last_error: state.last_error.clone(),
            total_delivered: state.total_delivered,
            total_evicted: state.total_evicted,
            total_excluded: state.total_excluded,
        }
    }
}
