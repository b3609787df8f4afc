//! Payload delivery with one retry and status classification.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::transport::Transport;

/// Attempts per payload: the initial post plus exactly one retry.
const MAX_ATTEMPTS: usize = 2;

pub const DEFAULT_SCHEMA_VERSION: u32 = 4;

const SCHEMA_HEADER: &str = "X-Event-Schema";
const PAYLOAD_ID_HEADER: &str = "X-Event-Payload-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Analytics,
    Diagnostic,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Analytics => "analytics",
            PayloadKind::Diagnostic => "diagnostic",
        }
    }
}

/// A serialized payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub kind: PayloadKind,
    pub body: Vec<u8>,
    pub event_count: usize,
}

impl EventPayload {
    pub fn analytics(body: Vec<u8>, event_count: usize) -> Self {
        Self {
            kind: PayloadKind::Analytics,
            body,
            event_count,
        }
    }

    pub fn diagnostic(body: Vec<u8>) -> Self {
        Self {
            kind: PayloadKind::Diagnostic,
            body,
            event_count: 1,
        }
    }
}

/// Outcome of delivering one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSenderResult {
    pub success: bool,
    /// The collector rejected the credentials or request permanently; stop
    /// sending anything.
    pub must_shutdown: bool,
    /// Server clock from the response `Date` header.
    pub time_from_server: Option<DateTime<Utc>>,
}

impl EventSenderResult {
    pub fn success(time_from_server: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            must_shutdown: false,
            time_from_server,
        }
    }

    pub fn failure(must_shutdown: bool) -> Self {
        Self {
            success: false,
            must_shutdown,
            time_from_server: None,
        }
    }
}

#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_event_data(&self, payload: EventPayload) -> EventSenderResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Recoverable,
    PayloadTooLarge,
    Unrecoverable,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        400 | 408 | 429 => StatusClass::Recoverable,
        413 => StatusClass::PayloadTooLarge,
        400..=499 => StatusClass::Unrecoverable,
        _ => StatusClass::Recoverable,
    }
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// [`EventSender`] posting to the collector through a [`Transport`].
pub struct HttpEventSender<T: Transport> {
    transport: T,
    analytics_url: String,
    diagnostic_url: String,
    sdk_key: Option<String>,
    user_agent: String,
    schema_version: u32,
    retry_delay: Duration,
}

impl<T: Transport> HttpEventSender<T> {
    pub fn new(transport: T, base_uri: &str, retry_delay: Duration) -> Self {
        let base = base_uri.trim_end_matches('/');
        Self {
            transport,
            analytics_url: format!("{base}/bulk"),
            diagnostic_url: format!("{base}/diagnostic"),
            sdk_key: None,
            user_agent: format!("flagpipe/{}", env!("CARGO_PKG_VERSION")),
            schema_version: DEFAULT_SCHEMA_VERSION,
            retry_delay,
        }
    }

    pub fn with_sdk_key(mut self, sdk_key: Option<String>) -> Self {
        self.sdk_key = sdk_key;
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn headers(&self, kind: PayloadKind, payload_id: &str) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Content-Type", "application/json".to_string()),
            ("User-Agent", self.user_agent.clone()),
            (PAYLOAD_ID_HEADER, payload_id.to_string()),
        ];
        if kind == PayloadKind::Analytics {
            headers.push((SCHEMA_HEADER, self.schema_version.to_string()));
        }
        if let Some(key) = &self.sdk_key {
            headers.push(("Authorization", key.clone()));
        }
        headers
    }
}

#[async_trait]
impl<T: Transport> EventSender for HttpEventSender<T> {
    async fn send_event_data(&self, payload: EventPayload) -> EventSenderResult {
        let url = match payload.kind {
            PayloadKind::Analytics => &self.analytics_url,
            PayloadKind::Diagnostic => &self.diagnostic_url,
        };
        let kind = payload.kind.as_str();
        let payload_id = Uuid::new_v4().to_string();

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                warn!(
                    kind,
                    delay_ms = self.retry_delay.as_millis() as u64,
                    "Retrying event delivery after delay"
                );
                tokio::time::sleep(self.retry_delay).await;
            }

            let headers = self.headers(payload.kind, &payload_id);
            let response = match self.transport.post(url, headers, payload.body.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(kind, attempt, error = %e, "Event delivery failed");
                    continue;
                }
            };

            match classify_status(response.status) {
                StatusClass::Success => {
                    debug!(
                        kind,
                        status = response.status,
                        events = payload.event_count,
                        "Event payload delivered"
                    );
                    return EventSenderResult::success(
                        response.date.as_deref().and_then(parse_http_date),
                    );
                }
                StatusClass::Recoverable => {
                    warn!(kind, attempt, status = response.status, "Recoverable error posting events");
                }
                StatusClass::PayloadTooLarge => {
                    error!(
                        kind,
                        events = payload.event_count,
                        bytes = payload.body.len(),
                        "Event payload too large, discarding"
                    );
                    return EventSenderResult::failure(false);
                }
                StatusClass::Unrecoverable => {
                    error!(
                        kind,
                        status = response.status,
                        "Unrecoverable error posting events, event delivery disabled"
                    );
                    return EventSenderResult::failure(true);
                }
            }
        }

        warn!(kind, events = payload.event_count, "Giving up on event payload");
        EventSenderResult::failure(false)
    }
}

// ============================================================================
// In-memory sender
// ============================================================================

/// [`EventSender`] that records every payload instead of sending it.
///
/// Results are taken from a script in order; once the script runs out every
/// payload succeeds.
#[derive(Default)]
pub struct RecordingEventSender {
    payloads: Mutex<Vec<EventPayload>>,
    script: Mutex<VecDeque<EventSenderResult>>,
    delay: Option<Duration>,
}

impl RecordingEventSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each delivery for `delay` before recording it.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_result(&self, result: EventSenderResult) {
        self.script.lock().push_back(result);
    }

    pub fn payloads(&self) -> Vec<EventPayload> {
        self.payloads.lock().clone()
    }

    /// All analytics events delivered so far, flattened across payloads.
    pub fn analytics_events(&self) -> Vec<Value> {
        self.payloads
            .lock()
            .iter()
            .filter(|p| p.kind == PayloadKind::Analytics)
            .filter_map(|p| serde_json::from_slice::<Vec<Value>>(&p.body).ok())
            .flatten()
            .collect()
    }

    pub fn diagnostic_events(&self) -> Vec<Value> {
        self.payloads
            .lock()
            .iter()
            .filter(|p| p.kind == PayloadKind::Diagnostic)
            .filter_map(|p| serde_json::from_slice::<Value>(&p.body).ok())
            .collect()
    }
}

#[async_trait]
impl EventSender for RecordingEventSender {
    async fn send_event_data(&self, payload: EventPayload) -> EventSenderResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.payloads.lock().push(payload);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| EventSenderResult::success(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(202), StatusClass::Success);
        assert_eq!(classify_status(400), StatusClass::Recoverable);
        assert_eq!(classify_status(408), StatusClass::Recoverable);
        assert_eq!(classify_status(429), StatusClass::Recoverable);
        assert_eq!(classify_status(413), StatusClass::PayloadTooLarge);
        assert_eq!(classify_status(401), StatusClass::Unrecoverable);
        assert_eq!(classify_status(403), StatusClass::Unrecoverable);
        assert_eq!(classify_status(404), StatusClass::Unrecoverable);
        assert_eq!(classify_status(100), StatusClass::Recoverable);
        assert_eq!(classify_status(302), StatusClass::Recoverable);
        assert_eq!(classify_status(503), StatusClass::Recoverable);
    }

    #[test]
    fn test_parse_http_date() {
        let parsed = parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert_eq!(parsed.timestamp(), 784887151);
        assert!(parse_http_date("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_recording_sender_follows_script() {
        let sender = RecordingEventSender::new();
        sender.push_result(EventSenderResult::failure(true));

        let first = sender
            .send_event_data(EventPayload::analytics(b"[]".to_vec(), 0))
            .await;
        let second = sender
            .send_event_data(EventPayload::diagnostic(b"{}".to_vec()))
            .await;

        assert!(first.must_shutdown);
        assert!(second.success);
        assert_eq!(sender.payloads().len(), 2);
        assert_eq!(sender.diagnostic_events().len(), 1);
    }
}
