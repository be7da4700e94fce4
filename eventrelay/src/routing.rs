//! Topic selection for outgoing envelopes.

use std::collections::HashMap;

use eventrelay_types::{EventType, Topic};

/// Maps event types to broker topics.
///
/// Overrides take precedence over the default topic. A router without a
/// default leaves unlisted event types unroutable; the dispatcher
/// dead-letters those instead of guessing a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRouter {
    default_topic: Option<Topic>,
    overrides: HashMap<EventType, Topic>,
}

impl TopicRouter {
    /// Routes every event type to `topic` unless overridden.
    pub fn new(topic: Topic) -> Self {
        Self {
            default_topic: Some(topic),
            overrides: HashMap::new(),
        }
    }

    /// Routes only explicitly listed event types.
    pub fn explicit() -> Self {
        Self::default()
    }

    /// Sends `event_type` to `topic`.
    #[must_use]
    pub fn route(mut self, event_type: EventType, topic: Topic) -> Self {
        let _ = self.overrides.insert(event_type, topic);
        self
    }

    /// The topic for `event_type`, if any.
    pub fn resolve(&self, event_type: &EventType) -> Option<&Topic> {
        self.overrides
            .get(event_type)
            .or(self.default_topic.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Topic {
        Topic::try_new(name).unwrap()
    }

    fn event_type(name: &str) -> EventType {
        EventType::try_new(name).unwrap()
    }

    #[test]
    fn overrides_win_over_the_default_topic() {
        let router = TopicRouter::new(topic("domain-events"))
            .route(event_type("PaymentCaptured"), topic("payments"));

        assert_eq!(
            router.resolve(&event_type("PaymentCaptured")),
            Some(&topic("payments"))
        );
        assert_eq!(
            router.resolve(&event_type("OrderPlaced")),
            Some(&topic("domain-events"))
        );
    }

    #[test]
    fn explicit_router_leaves_unknown_types_unroutable() {
        let router = TopicRouter::explicit().route(event_type("OrderPlaced"), topic("orders"));

        assert_eq!(router.resolve(&event_type("OrderShipped")), None);
    }
}
