//! The broker-facing wire format.
//!
//! An [`Envelope`] wraps one outbox row with everything a consumer needs to
//! deduplicate, route and decode it. On the wire it is a JSON document whose
//! `format` field names the envelope version and whose payload travels as
//! standard base64, so any payload bytes survive unchanged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use eventrelay_types::{
    EventId, EventType, Headers, OutboxEvent, PartitionKey, SchemaVersion, Timestamp,
};

/// Format marker written into every encoded envelope.
pub const ENVELOPE_FORMAT: &str = "application/vnd.eventrelay.envelope.v1+json";

/// Content type of payloads produced by `OutboxAppender`.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type assumed when a row declares none.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors raised while building or parsing envelopes.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The row's payload does not match its declared content type.
    #[error("payload of event {event_id} is not valid {content_type}: {detail}")]
    MalformedPayload {
        /// Event whose payload was rejected.
        event_id: EventId,
        /// Declared content type.
        content_type: String,
        /// Parser message.
        detail: String,
    },

    /// The bytes are not a well-formed envelope.
    #[error("invalid envelope: {detail}")]
    InvalidEnvelope {
        /// Parser message.
        detail: String,
    },

    /// The envelope declares a format this codec does not understand.
    #[error("unsupported envelope format {format}")]
    UnsupportedFormat {
        /// The declared format.
        format: String,
    },
}

/// The unit handed to a broker publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Deduplication key for consumers.
    pub event_id: EventId,
    /// Payload shape name.
    pub event_type: EventType,
    /// Payload shape version.
    pub schema_version: SchemaVersion,
    /// Ordering key, also the broker partition key.
    pub partition_key: PartitionKey,
    /// When the event was recorded in the outbox.
    pub occurred_at: Timestamp,
    /// MIME type of `payload`.
    pub content_type: String,
    /// Correlation, causation and tenant headers.
    pub headers: Headers,
    /// Serialized event body.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Serializes the envelope into its wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        EnvelopeCodec::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    format: String,
    event_id: EventId,
    event_type: EventType,
    schema_version: SchemaVersion,
    partition_key: PartitionKey,
    occurred_at: Timestamp,
    content_type: String,
    headers: Headers,
    payload: String,
}

/// Converts outbox rows into envelopes and envelopes into wire bytes.
///
/// Encoding is deterministic: the same row always yields the same bytes,
/// because headers are ordered and field order is fixed.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Builds the envelope for `event`.
    ///
    /// The `content-type` header becomes the envelope content type and is
    /// removed from the forwarded headers. Payloads declared as JSON must
    /// parse as JSON.
    pub fn encode(event: &OutboxEvent) -> Result<Envelope, CodecError> {
        let content_type = event
            .headers
            .get(Headers::CONTENT_TYPE)
            .unwrap_or(OCTET_STREAM_CONTENT_TYPE)
            .to_string();

        if is_json(&content_type) {
            let _: serde::de::IgnoredAny =
                serde_json::from_slice(&event.payload).map_err(|error| {
                    CodecError::MalformedPayload {
                        event_id: event.id,
                        content_type: content_type.clone(),
                        detail: error.to_string(),
                    }
                })?;
        }

        Ok(Envelope {
            event_id: event.id,
            event_type: event.event_type.clone(),
            schema_version: event.schema_version.clone(),
            partition_key: event.partition_key.clone(),
            occurred_at: event.created_at,
            content_type,
            headers: event.headers.without(Headers::CONTENT_TYPE),
            payload: event.payload.clone(),
        })
    }

    /// Serializes `envelope` into wire bytes.
    pub fn to_bytes(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let wire = WireEnvelope {
            format: ENVELOPE_FORMAT.to_string(),
            event_id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            schema_version: envelope.schema_version.clone(),
            partition_key: envelope.partition_key.clone(),
            occurred_at: envelope.occurred_at,
            content_type: envelope.content_type.clone(),
            headers: envelope.headers.clone(),
            payload: STANDARD.encode(&envelope.payload),
        };

        serde_json::to_vec(&wire).map_err(|error| CodecError::InvalidEnvelope {
            detail: error.to_string(),
        })
    }

    /// Parses wire bytes produced by [`to_bytes`](Self::to_bytes).
    pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
        let wire: WireEnvelope =
            serde_json::from_slice(bytes).map_err(|error| CodecError::InvalidEnvelope {
                detail: error.to_string(),
            })?;

        if wire.format != ENVELOPE_FORMAT {
            return Err(CodecError::UnsupportedFormat {
                format: wire.format,
            });
        }

        let payload =
            STANDARD
                .decode(wire.payload.as_bytes())
                .map_err(|error| CodecError::InvalidEnvelope {
                    detail: format!("payload is not base64: {error}"),
                })?;

        Ok(Envelope {
            event_id: wire.event_id,
            event_type: wire.event_type,
            schema_version: wire.schema_version,
            partition_key: wire.partition_key,
            occurred_at: wire.occurred_at,
            content_type: wire.content_type,
            headers: wire.headers,
            payload,
        })
    }
}

/// `application/json`, `application/json; charset=utf-8` and `+json`
/// structured suffixes all count as JSON.
pub(crate) fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == JSON_CONTENT_TYPE || essence.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(payload: &[u8], headers: Headers) -> OutboxEvent {
        OutboxEvent::new(
            EventId::new(),
            PartitionKey::try_new("order-7").unwrap(),
            EventType::try_new("OrderPlaced").unwrap(),
            SchemaVersion::initial(),
            payload.to_vec(),
            headers,
            Timestamp::now(),
        )
    }

    #[test]
    fn encode_lifts_content_type_out_of_headers() {
        // Given: a JSON row with a correlation id
        let headers = Headers::new()
            .with(Headers::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .with_correlation_id("corr-1");
        let event = row(br#"{"total":42}"#, headers);

        // When: the row is encoded
        let envelope = EnvelopeCodec::encode(&event).unwrap();

        // Then: the content type moves to the envelope and other headers stay
        assert_eq!(envelope.content_type, JSON_CONTENT_TYPE);
        assert_eq!(envelope.headers.get(Headers::CONTENT_TYPE), None);
        assert_eq!(envelope.headers.get(Headers::CORRELATION_ID), Some("corr-1"));
        assert_eq!(envelope.event_id, event.id);
        assert_eq!(envelope.occurred_at, event.created_at);
    }

    #[test]
    fn rows_without_content_type_are_opaque_bytes() {
        let event = row(&[0xff, 0x00, 0x7f], Headers::new());

        let envelope = EnvelopeCodec::encode(&event).unwrap();

        assert_eq!(envelope.content_type, OCTET_STREAM_CONTENT_TYPE);
        assert_eq!(envelope.payload, vec![0xff, 0x00, 0x7f]);
    }

    #[test]
    fn json_rows_with_broken_payload_are_malformed() {
        // Given: a row that claims JSON but carries garbage
        let event = row(
            b"{not json",
            Headers::new().with(Headers::CONTENT_TYPE, JSON_CONTENT_TYPE),
        );

        // When / Then: encoding is rejected with the event id in the error
        match EnvelopeCodec::encode(&event) {
            Err(CodecError::MalformedPayload { event_id, .. }) => assert_eq!(event_id, event.id),
            other => panic!("expected MalformedPayload, got {other:?}"),
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let headers = Headers::new()
            .with_tenant_id("acme")
            .with_correlation_id("corr-9")
            .with(Headers::CONTENT_TYPE, JSON_CONTENT_TYPE);
        let event = row(br#"{"a":1}"#, headers);

        let first = EnvelopeCodec::encode(&event).unwrap().to_bytes().unwrap();
        let second = EnvelopeCodec::encode(&event).unwrap().to_bytes().unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn wire_bytes_carry_format_marker_and_base64_payload() {
        let event = row(br#"{"a":1}"#, Headers::new());
        let bytes = EnvelopeCodec::encode(&event).unwrap().to_bytes().unwrap();

        let document: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(document["format"], ENVELOPE_FORMAT);
        assert_eq!(document["payload"], STANDARD.encode(br#"{"a":1}"#));
        assert_eq!(document["partition_key"], "order-7");
    }

    #[test]
    fn decode_restores_the_envelope() {
        let event = row(
            br#"{"a":1}"#,
            Headers::new().with(Headers::CONTENT_TYPE, JSON_CONTENT_TYPE),
        );
        let envelope = EnvelopeCodec::encode(&event).unwrap();

        let decoded = EnvelopeCodec::decode(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_rejects_unknown_formats() {
        let event = row(b"x", Headers::new());
        let bytes = EnvelopeCodec::encode(&event).unwrap().to_bytes().unwrap();
        let mut document: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        document["format"] = serde_json::Value::from("application/vnd.other+json");

        let result = EnvelopeCodec::decode(&serde_json::to_vec(&document).unwrap());

        assert!(matches!(result, Err(CodecError::UnsupportedFormat { .. })));
    }

    #[test]
    fn decode_rejects_non_json_input() {
        assert!(matches!(
            EnvelopeCodec::decode(b"\x00\x01"),
            Err(CodecError::InvalidEnvelope { .. })
        ));
    }

    #[test]
    fn json_detection_accepts_parameters_and_suffixes() {
        assert!(is_json("application/json; charset=utf-8"));
        assert!(is_json("application/cloudevents+json"));
        assert!(!is_json("application/avro"));
    }
}
