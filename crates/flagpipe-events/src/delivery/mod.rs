//! Delivery of serialized payloads to the collector.

pub mod sender;
pub mod transport;

pub use sender::{
    EventPayload, EventSender, EventSenderResult, HttpEventSender, PayloadKind,
    RecordingEventSender, StatusClass, classify_status,
};
pub use transport::{ReqwestTransport, Transport, TransportError, TransportResponse};
