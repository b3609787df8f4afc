//! Producer-facing event processor.
//!
//! ## Architecture
//!
//! ```text
//! Producers                   Background
//! ─────────                   ──────────
//! [EventProcessor::send]      [Dispatcher] ── spawn ──► [Delivery] ─► EventSender
//!     │ try_send()                 ▲                     (≤ N in flight)
//!     ▼                            │ recv()
//! [Bounded intake channel] ────────┘
//!                             [Diagnostics timer] ───────────────────► EventSender
//! ```
//!
//! `send` never blocks: when the intake is full the event is dropped and
//! counted. After `close` every call is a no-op.

mod dispatcher;
pub mod stats;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flagpipe_common::Reference;

use crate::config::Config;
use crate::delivery::{EventSender, HttpEventSender, ReqwestTransport, TransportError};
use crate::diagnostics::{DiagnosticsManager, spawn_diagnostics};
use crate::events::InputEvent;
use dispatcher::{Dispatcher, DispatcherMessage};
pub use stats::{EventStats, EventStatsSnapshot};

/// Log intake drops once per this many.
const DROP_LOG_THRESHOLD: u64 = 100;

/// Parameters for the processor and its background tasks.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub capacity: usize,
    pub flush_interval: Duration,
    pub context_keys_capacity: usize,
    pub context_keys_flush_interval: Duration,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<Reference>,
    pub omit_anonymous_contexts: bool,
    pub force_sampling: bool,
    pub max_concurrent_deliveries: usize,
    pub diagnostic_recording_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            flush_interval: Duration::from_secs(5),
            context_keys_capacity: 1000,
            context_keys_flush_interval: Duration::from_secs(300),
            all_attributes_private: false,
            private_attributes: Vec::new(),
            omit_anonymous_contexts: false,
            force_sampling: false,
            max_concurrent_deliveries: 5,
            diagnostic_recording_interval: Duration::from_secs(900),
        }
    }
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        let events = &config.events;
        Self {
            capacity: events.capacity,
            flush_interval: events.flush_interval(),
            context_keys_capacity: events.context_keys_capacity,
            context_keys_flush_interval: events.context_keys_flush_interval(),
            all_attributes_private: events.all_attributes_private,
            private_attributes: events.private_attributes.clone(),
            omit_anonymous_contexts: events.omit_anonymous_contexts,
            force_sampling: events.force_sampling,
            max_concurrent_deliveries: events.max_concurrent_deliveries,
            diagnostic_recording_interval: config.diagnostics.recording_interval(),
        }
    }
}

/// Delivery state shared by the dispatcher, delivery tasks and diagnostics.
#[derive(Debug, Default)]
pub struct DeliveryState {
    /// Set after an unrecoverable response; never cleared.
    disabled: AtomicBool,
    /// Last server time seen in a response, epoch milliseconds. 0 if unknown.
    server_time_ms: AtomicI64,
}

impl DeliveryState {
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn server_time_millis(&self) -> i64 {
        self.server_time_ms.load(Ordering::Acquire)
    }

    pub fn set_server_time(&self, millis: i64) {
        self.server_time_ms.store(millis, Ordering::Release);
    }
}

/// Handle to a running event pipeline.
///
/// `Send + Sync`; share it behind an `Arc` between producers.
pub struct EventProcessor {
    inbox: mpsc::Sender<DispatcherMessage>,
    closed: AtomicBool,
    stats: Arc<EventStats>,
    state: Arc<DeliveryState>,
    shutdown: broadcast::Sender<()>,
    last_drop_log: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventProcessor {
    /// Start the dispatcher (and the diagnostics task when `diagnostics` is
    /// given). Must be called inside a tokio runtime.
    pub fn new(
        config: ProcessorConfig,
        sender: Arc<dyn EventSender>,
        diagnostics: Option<Arc<DiagnosticsManager>>,
    ) -> Self {
        let (inbox, receiver) = mpsc::channel(config.capacity.max(1));
        let (shutdown, _) = broadcast::channel(1);
        let stats = Arc::new(EventStats::new());
        let state = Arc::new(DeliveryState::default());

        let mut tasks = Vec::with_capacity(2);
        if let Some(manager) = diagnostics {
            tasks.push(spawn_diagnostics(
                manager,
                Arc::clone(&sender),
                Arc::clone(&stats),
                Arc::clone(&state),
                config.diagnostic_recording_interval,
                shutdown.subscribe(),
            ));
        }

        let dispatcher = Dispatcher::new(config, sender, Arc::clone(&stats), Arc::clone(&state));
        tasks.push(tokio::spawn(dispatcher.run(receiver)));

        Self {
            inbox,
            closed: AtomicBool::new(false),
            stats,
            state,
            shutdown,
            last_drop_log: AtomicU64::new(0),
            tasks: Mutex::new(tasks),
        }
    }

    /// Build a processor delivering over HTTP according to `config`.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(config.events.request_timeout())?;
        let sender = HttpEventSender::new(transport, &config.events.base_uri, config.events.retry_delay())
            .with_sdk_key(config.sdk_key.clone())
            .with_schema_version(config.events.schema_version);
        let diagnostics = config
            .diagnostics
            .enabled
            .then(|| Arc::new(DiagnosticsManager::new(config)));

        Ok(Self::new(
            ProcessorConfig::from_config(config),
            Arc::new(sender),
            diagnostics,
        ))
    }

    /// Submit an event. Never blocks; drops the event if the intake is full.
    pub fn send(&self, event: InputEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.inbox.try_send(DispatcherMessage::Event(event)) {
            Ok(()) => self.stats.record_received(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_dropped(1);
                self.maybe_log_drops();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
            }
        }
    }

    /// Submit an event, waiting for intake space instead of dropping it.
    /// For bulk producers such as replay; SDK call paths use `send`.
    pub async fn submit(&self, event: InputEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.inbox.send(DispatcherMessage::Event(event)).await.is_ok() {
            self.stats.record_received();
        } else {
            self.closed.store(true, Ordering::Release);
        }
    }

    /// Request an asynchronous flush.
    pub fn flush(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.inbox.try_send(DispatcherMessage::Flush).is_err() {
            debug!("Intake full, flush request skipped");
        }
    }

    /// Flush and wait until every in-flight delivery has finished. Returns
    /// false if `timeout` elapsed first or the processor is closed.
    pub async fn flush_and_wait(&self, timeout: Duration) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let (done, finished) = oneshot::channel();
        let wait = async {
            self.inbox
                .send(DispatcherMessage::FlushAndWait(done))
                .await
                .is_ok()
                && finished.await.is_ok()
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(completed) => completed,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for flush");
                false
            }
        }
    }

    /// Stop intake, deliver what is buffered and stop background tasks.
    /// Later calls, and every `send` afterwards, do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (done, finished) = oneshot::channel();
        if self.inbox.send(DispatcherMessage::Close(done)).await.is_ok() {
            let _ = finished.await;
        }
        let _ = self.shutdown.send(());

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Event processor task failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once the collector has rejected delivery permanently.
    pub fn delivery_disabled(&self) -> bool {
        self.state.is_disabled()
    }

    pub fn stats(&self) -> &EventStats {
        &self.stats
    }

    pub fn stats_handle(&self) -> Arc<EventStats> {
        Arc::clone(&self.stats)
    }

    pub fn stats_snapshot(&self) -> EventStatsSnapshot {
        self.stats.snapshot()
    }

    fn maybe_log_drops(&self) {
        let total_drops = self.stats.dropped.load(Ordering::Relaxed);
        let last_log = self.last_drop_log.load(Ordering::Relaxed);

        if total_drops >= last_log + DROP_LOG_THRESHOLD
            && self
                .last_drop_log
                .compare_exchange(last_log, total_drops, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        {
            warn!(total_drops, "Event intake full, dropping events");
        }
    }
}
