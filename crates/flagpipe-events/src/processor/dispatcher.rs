//! The dispatcher task.
//!
//! Sole owner of the outbox, the summarizer and the context dedup cache. All
//! mutation happens on this task; producers only reach it through the intake
//! channel. Serialization and HTTP run on spawned delivery tasks bounded by a
//! semaphore, so the loop keeps draining the intake while payloads are in
//! flight.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use flagpipe_common::Context;

use super::stats::EventStats;
use super::{DeliveryState, ProcessorConfig};
use crate::delivery::{EventPayload, EventSender};
use crate::events::types::now_millis;
use crate::events::{
    BaseEvent, CustomRecord, DedupCache, EvaluationRecord, FlushSnapshot, IdentifyRecord,
    IndexRecord, InputEvent, Outbox, OutputEvent, OutputFormatter,
};

/// Messages accepted by the dispatcher.
#[derive(Debug)]
pub(crate) enum DispatcherMessage {
    Event(InputEvent),
    Flush,
    /// Flush, then signal once every in-flight delivery has finished.
    FlushAndWait(oneshot::Sender<()>),
    /// Final flush, wait for deliveries, signal, stop.
    Close(oneshot::Sender<()>),
}

pub(crate) struct Dispatcher {
    config: ProcessorConfig,
    outbox: Outbox,
    dedup: DedupCache,
    formatter: Arc<OutputFormatter>,
    sender: Arc<dyn EventSender>,
    stats: Arc<EventStats>,
    state: Arc<DeliveryState>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: ProcessorConfig,
        sender: Arc<dyn EventSender>,
        stats: Arc<EventStats>,
        state: Arc<DeliveryState>,
    ) -> Self {
        let formatter = Arc::new(OutputFormatter::new(
            config.all_attributes_private,
            &config.private_attributes,
        ));
        Self {
            outbox: Outbox::new(config.capacity),
            dedup: DedupCache::new(config.context_keys_capacity),
            permits: Arc::new(Semaphore::new(config.max_concurrent_deliveries)),
            formatter,
            sender,
            stats,
            state,
            config,
        }
    }

    /// Run until a close message arrives or every producer handle is dropped.
    pub(crate) async fn run(mut self, mut inbox: mpsc::Receiver<DispatcherMessage>) {
        let start = Instant::now();
        let mut flush_timer = interval_at(start + self.config.flush_interval, self.config.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut context_key_timer = interval_at(
            start + self.config.context_keys_flush_interval,
            self.config.context_keys_flush_interval,
        );
        context_key_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            capacity = self.config.capacity,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            max_concurrent_deliveries = self.config.max_concurrent_deliveries,
            "Event dispatcher started"
        );

        loop {
            tokio::select! {
                message = inbox.recv() => {
                    match message {
                        Some(DispatcherMessage::Event(event)) => self.process_event(event),
                        Some(DispatcherMessage::Flush) => self.flush(),
                        Some(DispatcherMessage::FlushAndWait(done)) => {
                            self.flush_when_ready().await;
                            self.notify_when_idle(done);
                        }
                        Some(DispatcherMessage::Close(done)) => {
                            info!("Close requested, performing final flush");
                            self.flush_when_ready().await;
                            self.wait_for_deliveries().await;
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            info!("Intake channel closed, performing final flush");
                            self.flush_when_ready().await;
                            self.wait_for_deliveries().await;
                            break;
                        }
                    }
                }

                _ = flush_timer.tick() => self.flush(),

                _ = context_key_timer.tick() => {
                    debug!(entries = self.dedup.len(), "Resetting context key cache");
                    self.dedup.clear();
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            dropped = stats.dropped,
            flushes = stats.flushes,
            delivery_failures = stats.delivery_failures,
            "Event dispatcher stopped"
        );
    }

    // ========================================================================
    // Event rules
    // ========================================================================

    pub(crate) fn process_event(&mut self, event: InputEvent) {
        match event {
            InputEvent::Evaluation(e) => self.process_evaluation(e),
            InputEvent::Identify(e) => self.process_identify(e),
            InputEvent::Custom(e) => self.process_custom(e),
            InputEvent::MigrationOp(e) => {
                if self.sampled(e.sampling_ratio) {
                    self.add(OutputEvent::MigrationOp(e));
                }
            }
            InputEvent::Index(e) => self.add(OutputEvent::Index(e)),
            InputEvent::Raw(raw) => self.add(OutputEvent::Raw(raw)),
        }
    }

    fn process_evaluation(&mut self, event: EvaluationRecord) {
        if !event.exclude_from_summaries {
            self.outbox.add_to_summary(&event);
        }

        let full_event = event.track_events && self.sampled(event.sampling_ratio);
        let debug_event = self.debug_active(event.debug_events_until_date)
            && self.sampled(event.sampling_ratio);

        self.notice_context(&event.base.context, event.base.creation_date);

        match (full_event, debug_event) {
            (true, true) => {
                self.add(OutputEvent::Feature(event.clone()));
                self.add(OutputEvent::Debug(event));
            }
            (true, false) => self.add(OutputEvent::Feature(event)),
            (false, true) => self.add(OutputEvent::Debug(event)),
            (false, false) => {}
        }
    }

    fn process_identify(&mut self, event: IdentifyRecord) {
        let context = if self.config.omit_anonymous_contexts {
            match event.base.context.without_anonymous_contexts() {
                Some(context) => context,
                None => return,
            }
        } else {
            event.base.context
        };

        self.dedup.add(&context.canonical_key());
        if self.sampled(event.sampling_ratio) {
            self.add(OutputEvent::Identify(IdentifyRecord {
                base: BaseEvent {
                    creation_date: event.base.creation_date,
                    context,
                },
                sampling_ratio: event.sampling_ratio,
            }));
        }
    }

    fn process_custom(&mut self, event: CustomRecord) {
        self.notice_context(&event.base.context, event.base.creation_date);
        if self.sampled(event.sampling_ratio) {
            self.add(OutputEvent::Custom(event));
        }
    }

    /// Emit an index event the first time a context is seen in the current
    /// dedup window.
    fn notice_context(&mut self, context: &Context, creation_date: i64) {
        let context = if self.config.omit_anonymous_contexts {
            match context.without_anonymous_contexts() {
                Some(context) => Cow::Owned(context),
                None => return,
            }
        } else {
            Cow::Borrowed(context)
        };

        if self.dedup.add(&context.canonical_key()) {
            self.stats.record_deduplicated();
            return;
        }
        self.add(OutputEvent::Index(IndexRecord {
            base: BaseEvent {
                creation_date,
                context: context.into_owned(),
            },
        }));
    }

    /// Debugging stays on while the deadline is ahead of both our clock and
    /// the collector's.
    fn debug_active(&self, until: Option<i64>) -> bool {
        let Some(until) = until else {
            return false;
        };
        until > now_millis() && until > self.state.server_time_millis()
    }

    fn sampled(&self, ratio: Option<u32>) -> bool {
        if self.config.force_sampling {
            return true;
        }
        match ratio {
            None | Some(1) => true,
            Some(0) => false,
            Some(n) => rand::thread_rng().gen_range(0..n) == 0,
        }
    }

    fn add(&mut self, event: OutputEvent) {
        if !self.outbox.add_event(event) {
            self.stats.record_dropped(1);
        }
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Start a delivery if a worker is free; otherwise leave the events for
    /// the next flush.
    fn flush(&mut self) {
        if self.discard_if_disabled() || self.outbox.is_empty() {
            return;
        }
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => self.start_delivery(permit),
            Err(_) => {
                debug!(
                    pending = self.outbox.len(),
                    "All delivery workers busy, deferring flush"
                );
            }
        }
    }

    /// Like `flush`, but waits for a free worker instead of deferring.
    async fn flush_when_ready(&mut self) {
        if self.discard_if_disabled() || self.outbox.is_empty() {
            return;
        }
        if let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await {
            // A delivery that finished meanwhile may have disabled delivery.
            if !self.discard_if_disabled() {
                self.start_delivery(permit);
            }
        }
    }

    fn discard_if_disabled(&mut self) -> bool {
        if self.state.is_disabled() {
            self.outbox.clear();
            return true;
        }
        false
    }

    fn start_delivery(&mut self, permit: OwnedSemaphorePermit) {
        let snapshot = self.outbox.snapshot();
        self.outbox.clear();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        let delivery = Delivery {
            formatter: Arc::clone(&self.formatter),
            sender: Arc::clone(&self.sender),
            stats: Arc::clone(&self.stats),
            state: Arc::clone(&self.state),
        };
        tokio::spawn(async move {
            delivery.run(snapshot).await;
            drop(permit);
        });
    }

    /// Signal `waiter` once no delivery is in flight.
    fn notify_when_idle(&self, waiter: oneshot::Sender<()>) {
        let permits = Arc::clone(&self.permits);
        let total = self.total_permits();
        tokio::spawn(async move {
            if let Ok(all) = permits.acquire_many_owned(total).await {
                drop(all);
            }
            let _ = waiter.send(());
        });
    }

    async fn wait_for_deliveries(&self) {
        if let Ok(all) = self.permits.acquire_many(self.total_permits()).await {
            drop(all);
        }
    }

    fn total_permits(&self) -> u32 {
        u32::try_from(self.config.max_concurrent_deliveries).unwrap_or(u32::MAX)
    }

    #[cfg(test)]
    pub(crate) fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

/// Work carried by one delivery task.
struct Delivery {
    formatter: Arc<OutputFormatter>,
    sender: Arc<dyn EventSender>,
    stats: Arc<EventStats>,
    state: Arc<DeliveryState>,
}

impl Delivery {
    async fn run(self, snapshot: FlushSnapshot) {
        let payload = match self.formatter.format(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize event payload");
                self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_dropped(snapshot.len() as u64);
                return;
            }
        };

        if payload.skipped > 0 {
            self.stats
                .malformed_contexts
                .fetch_add(payload.skipped as u64, Ordering::Relaxed);
        }
        if payload.event_count == 0 || self.state.is_disabled() {
            return;
        }

        self.stats
            .events_in_last_batch
            .store(payload.event_count as u64, Ordering::Relaxed);
        debug!(
            events = payload.event_count,
            bytes = payload.body.len(),
            "Flushing events"
        );

        let result = self
            .sender
            .send_event_data(EventPayload::analytics(payload.body, payload.event_count))
            .await;

        if let Some(time) = result.time_from_server {
            self.state.set_server_time(time.timestamp_millis());
        }
        if result.must_shutdown {
            self.state.disable();
        }
        if !result.success {
            warn!(events = payload.event_count, "Payload abandoned after delivery failure");
            self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
            self.stats.record_dropped(payload.event_count as u64);
        }
    }
}
