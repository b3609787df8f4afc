//! SDK diagnostics.
//!
//! One `diagnostic-init` event at startup, then a `diagnostic` statistics
//! event every recording interval. Runs on its own task and timer, separate
//! from the analytics flush cycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::delivery::{EventPayload, EventSender};
use crate::events::types::now_millis;
use crate::processor::{DeliveryState, EventStats, EventStatsSnapshot};

const SDK_NAME: &str = "flagpipe";
const PLATFORM_NAME: &str = "flagpipe-rust";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticId {
    pub diagnostic_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_key_suffix: Option<String>,
}

impl DiagnosticId {
    fn new(sdk_key: Option<&str>) -> Self {
        let sdk_key_suffix = sdk_key.map(|key| {
            let start = key
                .char_indices()
                .rev()
                .nth(5)
                .map(|(i, _)| i)
                .unwrap_or(0);
            key[start..].to_string()
        });
        Self {
            diagnostic_id: Uuid::new_v4().to_string(),
            sdk_key_suffix,
        }
    }
}

/// One streaming connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInit {
    pub timestamp: i64,
    pub failed: bool,
    pub duration_millis: u64,
}

/// Static description of how the SDK is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticConfiguration {
    pub custom_events_uri: bool,
    pub events_capacity: usize,
    pub events_flush_interval_millis: u64,
    pub context_keys_capacity: usize,
    pub context_keys_flush_interval_millis: u64,
    pub all_attributes_private: bool,
    pub omit_anonymous_contexts: bool,
    pub diagnostic_recording_interval_millis: u64,
}

impl DiagnosticConfiguration {
    pub fn from_config(config: &Config) -> Self {
        let events = &config.events;
        Self {
            custom_events_uri: events.custom_base_uri(),
            events_capacity: events.capacity,
            events_flush_interval_millis: events.flush_interval().as_millis() as u64,
            context_keys_capacity: events.context_keys_capacity,
            context_keys_flush_interval_millis: events.context_keys_flush_interval().as_millis()
                as u64,
            all_attributes_private: events.all_attributes_private,
            omit_anonymous_contexts: events.omit_anonymous_contexts,
            diagnostic_recording_interval_millis: config
                .diagnostics
                .recording_interval()
                .as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SdkInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlatformInfo {
    name: &'static str,
    os_name: &'static str,
    os_arch: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticInitEvent {
    kind: &'static str,
    id: DiagnosticId,
    creation_date: i64,
    sdk: SdkInfo,
    configuration: DiagnosticConfiguration,
    platform: PlatformInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticStatsEvent {
    kind: &'static str,
    id: DiagnosticId,
    pub creation_date: i64,
    pub data_since_date: i64,
    pub dropped_events: u64,
    pub deduplicated_contexts: u64,
    pub events_in_last_batch: u64,
    pub stream_inits: Vec<StreamInit>,
}

#[derive(Debug)]
struct DiagnosticsState {
    data_since: i64,
    stream_inits: Vec<StreamInit>,
}

/// Accumulates diagnostics between statistics events.
#[derive(Debug)]
pub struct DiagnosticsManager {
    id: DiagnosticId,
    configuration: DiagnosticConfiguration,
    start_time: i64,
    state: Mutex<DiagnosticsState>,
}

impl DiagnosticsManager {
    pub fn new(config: &Config) -> Self {
        let now = now_millis();
        Self {
            id: DiagnosticId::new(config.sdk_key.as_deref()),
            configuration: DiagnosticConfiguration::from_config(config),
            start_time: now,
            state: Mutex::new(DiagnosticsState {
                data_since: now,
                stream_inits: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &DiagnosticId {
        &self.id
    }

    /// Record a streaming connection attempt.
    pub fn record_stream_init(&self, timestamp: i64, failed: bool, duration: Duration) {
        self.state.lock().stream_inits.push(StreamInit {
            timestamp,
            failed,
            duration_millis: duration.as_millis() as u64,
        });
    }

    pub fn create_init_event(&self) -> DiagnosticInitEvent {
        DiagnosticInitEvent {
            kind: "diagnostic-init",
            id: self.id.clone(),
            creation_date: self.start_time,
            sdk: SdkInfo {
                name: SDK_NAME,
                version: env!("CARGO_PKG_VERSION"),
            },
            configuration: self.configuration.clone(),
            platform: PlatformInfo {
                name: PLATFORM_NAME,
                os_name: std::env::consts::OS,
                os_arch: std::env::consts::ARCH,
            },
        }
    }

    /// Build a statistics event for the window since the previous one, then
    /// start a new window.
    pub fn create_stats_event_and_reset(
        &self,
        dropped_events: u64,
        deduplicated_contexts: u64,
        events_in_last_batch: u64,
    ) -> DiagnosticStatsEvent {
        let now = now_millis();
        let mut state = self.state.lock();
        let data_since = std::mem::replace(&mut state.data_since, now);
        let stream_inits = std::mem::take(&mut state.stream_inits);
        drop(state);

        DiagnosticStatsEvent {
            kind: "diagnostic",
            id: self.id.clone(),
            creation_date: now,
            data_since_date: data_since,
            dropped_events,
            deduplicated_contexts,
            events_in_last_batch,
            stream_inits,
        }
    }
}

/// Spawn the diagnostics task: send the init event, then a statistics event
/// every `interval` until `shutdown` fires or its sender is dropped.
pub fn spawn_diagnostics(
    manager: Arc<DiagnosticsManager>,
    sender: Arc<dyn EventSender>,
    stats: Arc<EventStats>,
    state: Arc<DeliveryState>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            diagnostic_id = %manager.id().diagnostic_id,
            "Diagnostics started"
        );
        send_diagnostic(&*sender, &state, &manager.create_init_event()).await;

        let mut timer = interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = EventStatsSnapshot::default();

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let current = stats.snapshot();
                    let event = manager.create_stats_event_and_reset(
                        current.dropped.saturating_sub(last.dropped),
                        current.deduplicated_contexts.saturating_sub(last.deduplicated_contexts),
                        current.events_in_last_batch,
                    );
                    last = current;
                    send_diagnostic(&*sender, &state, &event).await;
                }

                _ = shutdown.recv() => break,
            }
        }

        debug!("Diagnostics stopped");
    })
}

async fn send_diagnostic<E: Serialize>(sender: &dyn EventSender, state: &DeliveryState, event: &E) {
    if state.is_disabled() {
        return;
    }
    let body = match serde_json::to_vec(event) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to serialize diagnostic event");
            return;
        }
    };
    let result = sender.send_event_data(EventPayload::diagnostic(body)).await;
    if result.must_shutdown {
        state.disable();
    }
}
