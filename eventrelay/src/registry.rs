//! Consumer-side decoding of envelopes into typed events.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;

use crate::envelope::{is_json, Envelope};
use eventrelay_types::{EventType, SchemaVersion};

/// Errors raised by [`EventTypeRegistry`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The `(event_type, schema_version)` pair already has a decoder.
    #[error("decoder for {event_type} v{schema_version} is already registered")]
    DuplicateRegistration {
        /// Registered event type.
        event_type: EventType,
        /// Registered schema version.
        schema_version: SchemaVersion,
    },

    /// No decoder is registered for the envelope's pair.
    #[error("no decoder registered for {event_type} v{schema_version}")]
    UnknownEventType {
        /// Event type of the envelope.
        event_type: EventType,
        /// Schema version of the envelope.
        schema_version: SchemaVersion,
    },

    /// Only JSON payloads can be decoded.
    #[error("cannot decode {content_type} payload of {event_type}")]
    UnsupportedContentType {
        /// Event type of the envelope.
        event_type: EventType,
        /// Declared content type.
        content_type: String,
    },

    /// The payload did not match the registered shape.
    #[error("payload of {event_type} v{schema_version} does not decode: {detail}")]
    Undecodable {
        /// Event type of the envelope.
        event_type: EventType,
        /// Schema version of the envelope.
        schema_version: SchemaVersion,
        /// Deserializer message.
        detail: String,
    },
}

type Decoder<T> = Box<dyn Fn(&[u8]) -> Result<T, serde_json::Error> + Send + Sync>;

/// Maps `(event_type, schema_version)` pairs to typed decoders.
///
/// `T` is usually a consumer-side enum covering every event the consumer
/// understands; each registration deserializes one payload shape and lifts
/// it into `T`. Registering several versions of one event type lets a
/// consumer upcast old payloads.
pub struct EventTypeRegistry<T> {
    decoders: HashMap<(EventType, SchemaVersion), Decoder<T>>,
}

impl<T> EventTypeRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers a decoder deserializing payloads as `E` and mapping them
    /// into `T`.
    pub fn register<E, F>(
        &mut self,
        event_type: EventType,
        schema_version: SchemaVersion,
        map: F,
    ) -> Result<(), RegistryError>
    where
        T: 'static,
        E: DeserializeOwned,
        F: Fn(E) -> T + Send + Sync + 'static,
    {
        let key = (event_type, schema_version);
        if self.decoders.contains_key(&key) {
            let (event_type, schema_version) = key;
            return Err(RegistryError::DuplicateRegistration {
                event_type,
                schema_version,
            });
        }

        let decoder: Decoder<T> =
            Box::new(move |payload: &[u8]| serde_json::from_slice::<E>(payload).map(&map));
        let _ = self.decoders.insert(key, decoder);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<E, F>(
        mut self,
        event_type: EventType,
        schema_version: SchemaVersion,
        map: F,
    ) -> Result<Self, RegistryError>
    where
        T: 'static,
        E: DeserializeOwned,
        F: Fn(E) -> T + Send + Sync + 'static,
    {
        self.register(event_type, schema_version, map)?;
        Ok(self)
    }

    /// Whether a decoder exists for the pair.
    pub fn contains(&self, event_type: &EventType, schema_version: &SchemaVersion) -> bool {
        self.decoders
            .contains_key(&(event_type.clone(), schema_version.clone()))
    }

    /// Number of registered decoders.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether no decoder is registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes the payload of `envelope` with the matching decoder.
    pub fn decode(&self, envelope: &Envelope) -> Result<T, RegistryError> {
        let key = (envelope.event_type.clone(), envelope.schema_version.clone());
        let decoder = self
            .decoders
            .get(&key)
            .ok_or_else(|| RegistryError::UnknownEventType {
                event_type: envelope.event_type.clone(),
                schema_version: envelope.schema_version.clone(),
            })?;

        if !is_json(&envelope.content_type) {
            return Err(RegistryError::UnsupportedContentType {
                event_type: envelope.event_type.clone(),
                content_type: envelope.content_type.clone(),
            });
        }

        decoder(&envelope.payload).map_err(|error| RegistryError::Undecodable {
            event_type: envelope.event_type.clone(),
            schema_version: envelope.schema_version.clone(),
            detail: error.to_string(),
        })
    }
}

impl<T> Default for EventTypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventTypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered: Vec<String> = self
            .decoders
            .keys()
            .map(|(event_type, version)| format!("{event_type}@{version}"))
            .collect();
        registered.sort();
        f.debug_struct("EventTypeRegistry")
            .field("registered", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{JSON_CONTENT_TYPE, OCTET_STREAM_CONTENT_TYPE};
    use eventrelay_types::{EventId, Headers, PartitionKey, Timestamp};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderPlacedV1 {
        total: u64,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderPlacedV2 {
        total_cents: u64,
        currency: String,
    }

    #[derive(Debug, PartialEq)]
    enum OrderEvent {
        Placed { total_cents: u64, currency: String },
    }

    fn order_placed() -> EventType {
        EventType::try_new("OrderPlaced").unwrap()
    }

    fn version(v: &str) -> SchemaVersion {
        SchemaVersion::try_new(v).unwrap()
    }

    fn envelope(schema_version: SchemaVersion, content_type: &str, payload: &[u8]) -> Envelope {
        Envelope {
            event_id: EventId::new(),
            event_type: order_placed(),
            schema_version,
            partition_key: PartitionKey::try_new("order-1").unwrap(),
            occurred_at: Timestamp::now(),
            content_type: content_type.to_string(),
            headers: Headers::new(),
            payload: payload.to_vec(),
        }
    }

    fn registry() -> EventTypeRegistry<OrderEvent> {
        EventTypeRegistry::new()
            .with(order_placed(), version("1"), |v1: OrderPlacedV1| {
                OrderEvent::Placed {
                    total_cents: v1.total * 100,
                    currency: "USD".to_string(),
                }
            })
            .unwrap()
            .with(order_placed(), version("2"), |v2: OrderPlacedV2| {
                OrderEvent::Placed {
                    total_cents: v2.total_cents,
                    currency: v2.currency,
                }
            })
            .unwrap()
    }

    #[test]
    fn old_versions_are_upcast_through_their_decoder() {
        // Given: a registry knowing v1 and v2 of OrderPlaced
        let registry = registry();

        // When: a v1 payload arrives
        let decoded = registry
            .decode(&envelope(version("1"), JSON_CONTENT_TYPE, br#"{"total":3}"#))
            .unwrap();

        // Then: it is lifted into the current consumer shape
        assert_eq!(
            decoded,
            OrderEvent::Placed {
                total_cents: 300,
                currency: "USD".to_string()
            }
        );
    }

    #[test]
    fn unknown_versions_are_reported() {
        let result = registry().decode(&envelope(version("3"), JSON_CONTENT_TYPE, b"{}"));

        assert!(matches!(
            result,
            Err(RegistryError::UnknownEventType { .. })
        ));
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let mut registry = registry();

        let result = registry.register(order_placed(), version("1"), |v1: OrderPlacedV1| {
            OrderEvent::Placed {
                total_cents: v1.total,
                currency: "EUR".to_string(),
            }
        });

        assert!(matches!(
            result,
            Err(RegistryError::DuplicateRegistration { .. })
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn non_json_payloads_are_not_decoded() {
        let result = registry().decode(&envelope(
            version("1"),
            OCTET_STREAM_CONTENT_TYPE,
            br#"{"total":3}"#,
        ));

        assert!(matches!(
            result,
            Err(RegistryError::UnsupportedContentType { .. })
        ));
    }

    #[test]
    fn shape_mismatches_are_undecodable() {
        let result = registry().decode(&envelope(
            version("2"),
            JSON_CONTENT_TYPE,
            br#"{"total":3}"#,
        ));

        assert!(matches!(result, Err(RegistryError::Undecodable { .. })));
    }
}
