//! End-to-end pipeline behaviour against an in-memory sender.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use flagpipe_common::{Context, ContextBuilder, EvaluationDetail, FlagEventInfo, Reason, Reference};
use flagpipe_events::config::Config;
use flagpipe_events::delivery::{EventSenderResult, RecordingEventSender};
use flagpipe_events::diagnostics::DiagnosticsManager;
use flagpipe_events::events::EventFactory;
use flagpipe_events::processor::{EventProcessor, ProcessorConfig};

const WAIT: Duration = Duration::from_secs(5);

fn user(key: &str) -> Context {
    ContextBuilder::new(key).build().unwrap()
}

fn start(config: ProcessorConfig) -> (EventProcessor, Arc<RecordingEventSender>) {
    start_with(config, RecordingEventSender::new())
}

fn start_with(
    config: ProcessorConfig,
    sender: RecordingEventSender,
) -> (EventProcessor, Arc<RecordingEventSender>) {
    let sender = Arc::new(sender);
    let processor = EventProcessor::new(config, sender.clone(), None);
    (processor, sender)
}

fn of_kind<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
    events.iter().filter(|e| e["kind"] == json!(kind)).collect()
}

#[tokio::test]
async fn test_summary_counters_per_variation() {
    let (processor, sender) = start(ProcessorConfig::default());
    let factory = EventFactory::new(false);
    let mut flag = FlagEventInfo::new("beta-feature");
    flag.version = Some(5);

    let on = EvaluationDetail::new(json!(true), Some(0), Reason::Fallthrough { in_experiment: false });
    let off = EvaluationDetail::new(json!(false), Some(1), Reason::Off);
    processor.send(factory.new_evaluation(&flag, user("u1"), &on, json!(false), None));
    processor.send(factory.new_evaluation(&flag, user("u2"), &off, json!(false), None));

    assert!(processor.flush_and_wait(WAIT).await);

    let events = sender.analytics_events();
    assert_eq!(of_kind(&events, "index").len(), 2);
    assert!(of_kind(&events, "feature").is_empty());

    let summaries = of_kind(&events, "summary");
    assert_eq!(summaries.len(), 1);
    let feature = &summaries[0]["features"]["beta-feature"];
    assert_eq!(feature["default"], json!(false));
    assert_eq!(feature["contextKinds"], json!(["user"]));
    assert_eq!(
        feature["counters"],
        json!([
            {"variation": 0, "version": 5, "value": true, "count": 1},
            {"variation": 1, "version": 5, "value": false, "count": 1}
        ])
    );

    processor.close().await;
}

#[tokio::test]
async fn test_tracked_evaluation_and_custom_event() {
    let (processor, sender) = start(ProcessorConfig::default());
    let factory = EventFactory::new(false);
    let mut flag = FlagEventInfo::new("checkout");
    flag.track_events = true;
    let detail = EvaluationDetail::new(json!("new"), Some(2), Reason::TargetMatch);

    processor.send(factory.new_evaluation(&flag, user("u1"), &detail, json!("old"), None));
    processor.send(factory.new_custom(user("u1"), "purchase", Some(json!({"sku": "a"})), Some(12.0)));
    assert!(processor.flush_and_wait(WAIT).await);

    let events = sender.analytics_events();
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["kind"].as_str()).collect();
    assert_eq!(kinds, ["index", "feature", "custom", "summary"]);
    assert_eq!(events[1]["value"], json!("new"));
    assert_eq!(events[2]["contextKeys"], json!({"user": "u1"}));
    assert_eq!(events[2]["metricValue"], json!(12.0));

    processor.close().await;
}

#[tokio::test]
async fn test_contexts_deduplicated_across_flushes() {
    let (processor, sender) = start(ProcessorConfig::default());
    let factory = EventFactory::new(false);

    processor.send(factory.new_custom(user("u1"), "a", None, None));
    assert!(processor.flush_and_wait(WAIT).await);
    processor.send(factory.new_custom(user("u1"), "b", None, None));
    assert!(processor.flush_and_wait(WAIT).await);

    let events = sender.analytics_events();
    assert_eq!(of_kind(&events, "index").len(), 1);
    assert_eq!(of_kind(&events, "custom").len(), 2);
    assert_eq!(processor.stats_snapshot().deduplicated_contexts, 1);

    processor.close().await;
}

#[tokio::test]
async fn test_private_attributes_redacted_on_the_wire() {
    let config = ProcessorConfig {
        private_attributes: vec![Reference::parse("email").unwrap()],
        ..Default::default()
    };
    let (processor, sender) = start(config);
    let context = ContextBuilder::new("u1")
        .name("Ann")
        .set_value("email", json!("ann@example.com"))
        .build()
        .unwrap();

    processor.send(EventFactory::new(false).new_identify(context));
    assert!(processor.flush_and_wait(WAIT).await);

    let events = sender.analytics_events();
    assert_eq!(
        events[0]["context"],
        json!({
            "kind": "user",
            "key": "u1",
            "name": "Ann",
            "_meta": {"redactedAttributes": ["email"]}
        })
    );

    processor.close().await;
}

#[tokio::test]
async fn test_overflow_drops_excess_events() {
    let config = ProcessorConfig {
        capacity: 2,
        ..Default::default()
    };
    let (processor, sender) = start(config);
    let factory = EventFactory::new(false);
    for i in 0..5 {
        processor.send(factory.new_identify(user(&format!("u{i}"))));
    }
    assert!(processor.flush_and_wait(WAIT).await);

    assert_eq!(sender.analytics_events().len(), 2);
    assert_eq!(processor.stats_snapshot().dropped, 3);

    processor.close().await;
}

#[tokio::test]
async fn test_raw_event_forwarded_verbatim() {
    let (processor, sender) = start(ProcessorConfig::default());
    let raw = serde_json::value::RawValue::from_string(r#"{"kind":"custom","key":"raw"}"#.to_string())
        .unwrap();

    processor.send(flagpipe_events::InputEvent::Raw(raw));
    assert!(processor.flush_and_wait(WAIT).await);

    let payloads = sender.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].body, br#"[{"kind":"custom","key":"raw"}]"#);

    processor.close().await;
}

#[tokio::test]
async fn test_nothing_sent_when_empty() {
    let (processor, sender) = start(ProcessorConfig::default());
    assert!(processor.flush_and_wait(WAIT).await);
    processor.close().await;

    assert!(sender.payloads().is_empty());
}

#[tokio::test]
async fn test_unrecoverable_failure_disables_delivery() {
    let recording = RecordingEventSender::new();
    recording.push_result(EventSenderResult::failure(true));
    let (processor, sender) = start_with(ProcessorConfig::default(), recording);
    let factory = EventFactory::new(false);

    processor.send(factory.new_identify(user("u1")));
    assert!(processor.flush_and_wait(WAIT).await);
    assert!(processor.delivery_disabled());

    processor.send(factory.new_identify(user("u2")));
    assert!(processor.flush_and_wait(WAIT).await);
    processor.close().await;

    assert_eq!(sender.payloads().len(), 1);
    assert_eq!(processor.stats_snapshot().delivery_failures, 1);
}

#[tokio::test]
async fn test_close_delivers_pending_and_ignores_later_events() {
    let (processor, sender) = start(ProcessorConfig::default());
    let factory = EventFactory::new(false);

    processor.send(factory.new_identify(user("u1")));
    processor.close().await;
    assert_eq!(sender.analytics_events().len(), 1);
    assert!(processor.is_closed());

    processor.send(factory.new_identify(user("u2")));
    processor.flush();
    assert!(!processor.flush_and_wait(WAIT).await);
    processor.close().await;

    assert_eq!(processor.stats_snapshot().received, 1);
    assert_eq!(sender.payloads().len(), 1);
}

#[tokio::test]
async fn test_flush_and_wait_covers_slow_delivery() {
    let (processor, sender) = start_with(
        ProcessorConfig::default(),
        RecordingEventSender::new().with_delay(Duration::from_millis(50)),
    );
    processor.send(EventFactory::new(false).new_identify(user("u1")));

    assert!(processor.flush_and_wait(WAIT).await);
    assert_eq!(sender.payloads().len(), 1);

    processor.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_flush_and_wait_times_out() {
    let (processor, sender) = start_with(
        ProcessorConfig::default(),
        RecordingEventSender::new().with_delay(Duration::from_secs(60)),
    );
    processor.send(EventFactory::new(false).new_identify(user("u1")));

    assert!(!processor.flush_and_wait(Duration::from_millis(100)).await);
    assert!(sender.payloads().is_empty());

    processor.close().await;
    assert_eq!(sender.payloads().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flush_timer_delivers_without_explicit_flush() {
    let (processor, sender) = start(ProcessorConfig::default());
    processor.send(EventFactory::new(false).new_identify(user("u1")));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(sender.analytics_events().len(), 1);

    processor.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_init_and_periodic_events() {
    let config = ProcessorConfig {
        diagnostic_recording_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let sender = Arc::new(RecordingEventSender::new());
    let manager = Arc::new(DiagnosticsManager::new(&Config::default()));
    let processor = EventProcessor::new(config, sender.clone(), Some(manager));
    let factory = EventFactory::new(false);

    processor.send(factory.new_custom(user("u1"), "a", None, None));
    processor.send(factory.new_custom(user("u1"), "b", None, None));
    tokio::time::sleep(Duration::from_secs(61)).await;
    processor.close().await;

    let diagnostics = sender.diagnostic_events();
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(diagnostics[0]["kind"], json!("diagnostic-init"));
    assert_eq!(diagnostics[1]["kind"], json!("diagnostic"));
    assert_eq!(diagnostics[1]["deduplicatedContexts"], json!(1));
    assert_eq!(diagnostics[1]["droppedEvents"], json!(0));
    assert_eq!(diagnostics[1]["eventsInLastBatch"], json!(3));
}

fn single_worker() -> ProcessorConfig {
    ProcessorConfig {
        max_concurrent_deliveries: 1,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_delivers_events_buffered_behind_busy_worker() {
    let (processor, sender) = start_with(
        single_worker(),
        RecordingEventSender::new().with_delay(Duration::from_millis(200)),
    );
    let factory = EventFactory::new(false);

    processor.send(factory.new_identify(user("u1")));
    processor.flush();
    tokio::time::sleep(Duration::from_millis(20)).await;
    processor.send(factory.new_identify(user("u2")));
    processor.close().await;

    assert_eq!(sender.payloads().len(), 2);
    assert_eq!(sender.analytics_events().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_flush_and_wait_delivers_events_buffered_behind_busy_worker() {
    let (processor, sender) = start_with(
        single_worker(),
        RecordingEventSender::new().with_delay(Duration::from_millis(200)),
    );
    let factory = EventFactory::new(false);

    processor.send(factory.new_identify(user("u1")));
    processor.flush();
    tokio::time::sleep(Duration::from_millis(20)).await;
    processor.send(factory.new_identify(user("u2")));

    assert!(processor.flush_and_wait(WAIT).await);
    assert_eq!(sender.analytics_events().len(), 2);

    processor.close().await;
}

#[tokio::test]
async fn test_abandoned_payload_counts_as_dropped() {
    let recording = RecordingEventSender::new();
    recording.push_result(EventSenderResult::failure(false));
    let (processor, _sender) = start_with(ProcessorConfig::default(), recording);
    let factory = EventFactory::new(false);

    processor.send(factory.new_identify(user("u1")));
    processor.send(factory.new_identify(user("u2")));
    assert!(processor.flush_and_wait(WAIT).await);

    let stats = processor.stats_snapshot();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.delivery_failures, 1);
    assert!(!processor.delivery_disabled());

    processor.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_context_keys_forgotten_after_flush_interval() {
    let config = ProcessorConfig {
        context_keys_flush_interval: Duration::from_secs(10),
        ..Default::default()
    };
    let (processor, sender) = start(config);
    let factory = EventFactory::new(false);

    processor.send(factory.new_custom(user("u1"), "a", None, None));
    assert!(processor.flush_and_wait(WAIT).await);
    tokio::time::sleep(Duration::from_secs(11)).await;
    processor.send(factory.new_custom(user("u1"), "b", None, None));
    assert!(processor.flush_and_wait(WAIT).await);

    let events = sender.analytics_events();
    assert_eq!(of_kind(&events, "index").len(), 2);
    assert_eq!(processor.stats_snapshot().deduplicated_contexts, 0);

    processor.close().await;
}

#[tokio::test]
async fn test_submit_waits_for_intake_space() {
    let config = ProcessorConfig {
        capacity: 2,
        ..Default::default()
    };
    let (processor, _sender) = start(config);
    let factory = EventFactory::new(false);

    for i in 0..5 {
        processor.submit(factory.new_identify(user(&format!("u{i}")))).await;
    }
    assert!(processor.flush_and_wait(WAIT).await);

    assert_eq!(processor.stats_snapshot().received, 5);
    processor.close().await;
}
