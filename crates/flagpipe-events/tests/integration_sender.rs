//! Delivery retry and classification against a scripted transport.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use flagpipe_events::delivery::{
    EventPayload, EventSender, HttpEventSender, Transport, TransportError, TransportResponse,
};

#[derive(Debug, Clone)]
struct Request {
    url: String,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Returns scripted responses in order; 200 once the script is exhausted.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
    fn with_statuses(statuses: &[u16]) -> Self {
        let transport = Self::default();
        for status in statuses {
            transport
                .script
                .lock()
                .push_back(Ok(TransportResponse::new(*status)));
        }
        transport
    }

    fn push(&self, response: Result<TransportResponse, TransportError>) {
        self.script.lock().push_back(response);
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(
        &self,
        url: &str,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError> {
        self.requests.lock().push(Request {
            url: url.to_string(),
            headers,
            body,
        });
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(TransportResponse::new(200)))
    }
}

fn sender(transport: ScriptedTransport) -> HttpEventSender<ScriptedTransport> {
    HttpEventSender::new(transport, "http://collector.test/", Duration::from_millis(1))
        .with_sdk_key(Some("sdk-key-123".to_string()))
}

fn payload() -> EventPayload {
    EventPayload::analytics(br#"[{"kind":"index"}]"#.to_vec(), 1)
}

#[tokio::test]
async fn test_recoverable_then_success() {
    let sender = sender(ScriptedTransport::with_statuses(&[503, 202]));
    let result = sender.send_event_data(payload()).await;

    assert!(result.success);
    assert!(!result.must_shutdown);
    assert_eq!(sender.transport().requests().len(), 2);
}

#[tokio::test]
async fn test_two_recoverable_failures_give_up() {
    let sender = sender(ScriptedTransport::with_statuses(&[503, 429]));
    let result = sender.send_event_data(payload()).await;

    assert!(!result.success);
    assert!(!result.must_shutdown);
    assert_eq!(sender.transport().requests().len(), 2);
}

#[tokio::test]
async fn test_unauthorized_shuts_down_without_retry() {
    let sender = sender(ScriptedTransport::with_statuses(&[401]));
    let result = sender.send_event_data(payload()).await;

    assert!(!result.success);
    assert!(result.must_shutdown);
    assert_eq!(sender.transport().requests().len(), 1);
}

#[tokio::test]
async fn test_payload_too_large_fails_without_shutdown() {
    let sender = sender(ScriptedTransport::with_statuses(&[413]));
    let result = sender.send_event_data(payload()).await;

    assert!(!result.success);
    assert!(!result.must_shutdown);
    assert_eq!(sender.transport().requests().len(), 1);
}

#[tokio::test]
async fn test_transport_error_is_retried() {
    let transport = ScriptedTransport::default();
    transport.push(Err(TransportError::Io("connection reset".to_string())));
    transport.push(Ok(TransportResponse::new(200)));

    let sender = sender(transport);
    let result = sender.send_event_data(payload()).await;

    assert!(result.success);
    assert_eq!(sender.transport().requests().len(), 2);
}

#[tokio::test]
async fn test_analytics_request_headers() {
    let sender = sender(ScriptedTransport::with_statuses(&[500, 200]));
    sender.send_event_data(payload()).await;

    let requests = sender.transport().requests();
    let first = &requests[0];
    assert_eq!(first.url, "http://collector.test/bulk");
    assert_eq!(first.header("Content-Type"), Some("application/json"));
    assert_eq!(first.header("X-Event-Schema"), Some("4"));
    assert_eq!(first.header("Authorization"), Some("sdk-key-123"));
    assert!(first.header("User-Agent").unwrap().starts_with("flagpipe/"));
    assert_eq!(first.body, br#"[{"kind":"index"}]"#);

    let id = first.header("X-Event-Payload-ID").unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
    assert_eq!(requests[1].header("X-Event-Payload-ID"), Some(id));
}

#[tokio::test]
async fn test_payload_ids_differ_between_payloads() {
    let sender = sender(ScriptedTransport::default());
    sender.send_event_data(payload()).await;
    sender.send_event_data(payload()).await;

    let requests = sender.transport().requests();
    assert_ne!(
        requests[0].header("X-Event-Payload-ID"),
        requests[1].header("X-Event-Payload-ID")
    );
}

#[tokio::test]
async fn test_diagnostic_request_omits_schema_header() {
    let sender = sender(ScriptedTransport::default()).with_schema_version(7);
    sender
        .send_event_data(EventPayload::diagnostic(br#"{"kind":"diagnostic"}"#.to_vec()))
        .await;
    sender.send_event_data(payload()).await;

    let requests = sender.transport().requests();
    assert_eq!(requests[0].url, "http://collector.test/diagnostic");
    assert!(requests[0].header("X-Event-Schema").is_none());
    assert_eq!(requests[1].header("X-Event-Schema"), Some("7"));
}

#[tokio::test]
async fn test_date_header_reports_server_time() {
    let transport = ScriptedTransport::default();
    transport.push(Ok(
        TransportResponse::new(202).with_date("Tue, 15 Nov 1994 08:12:31 GMT")
    ));

    let sender = sender(transport);
    let result = sender.send_event_data(payload()).await;

    let time = result.time_from_server.unwrap();
    assert_eq!(time.timestamp(), 784887151);
}

#[tokio::test]
async fn test_unparseable_date_is_ignored() {
    let transport = ScriptedTransport::default();
    transport.push(Ok(TransportResponse::new(200).with_date("not a date")));

    let sender = sender(transport);
    let result = sender.send_event_data(payload()).await;

    assert!(result.success);
    assert!(result.time_from_server.is_none());
}
