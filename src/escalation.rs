//! Retry and dead-letter escalation.
//!
//! When a handler fails, the worker hands the event to the [`Escalator`],
//! which republishes it to the application's single retry topic with
//! incremented retry metadata, or, once the retry budget is spent, to the
//! dead-letter topic.
//!
//! ```text
//! failure #1 ──► retry topic (retries=1, original_topic/group set)
//! failure #2 ──► retry topic (retries=2)
//! failure #3 ──► retry topic (retries=3)
//! failure #4 ──► dead-letter topic (unchanged, terminal)
//! ```
//!
//! Every business topic shares the one retry topic; the retry worker tells
//! events apart by their embedded `original_topic` / `original_group_id`.

use crate::event::Envelope;
use crate::publisher::{PublishError, Publisher};
use crate::MAX_FAILURES;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Retry and dead-letter names derived from the application name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureTopics {
    retry_topic: String,
    retry_group: String,
    dead_topic: String,
}

impl FailureTopics {
    pub fn for_app(app: &str) -> Self {
        Self {
            retry_topic: format!("{}_failure_topic", app),
            retry_group: format!("{}_failure_consumer", app),
            dead_topic: format!("{}_dead_topic", app),
        }
    }

    pub fn retry_topic(&self) -> &str {
        &self.retry_topic
    }

    pub fn retry_group(&self) -> &str {
        &self.retry_group
    }

    pub fn dead_topic(&self) -> &str {
        &self.dead_topic
    }

    /// Whether `topic` carries retry or dead-letter traffic.
    pub fn is_reserved_topic(&self, topic: &str) -> bool {
        topic == self.retry_topic || topic == self.dead_topic
    }

    /// The first of `group` / `topics` that is a reserved name.
    pub fn collision<'a>(
        &self,
        group: &'a str,
        topics: impl IntoIterator<Item = &'a str>,
    ) -> Option<&'a str> {
        if group == self.retry_group {
            return Some(group);
        }
        topics.into_iter().find(|topic| self.is_reserved_topic(topic))
    }
}

/// Where a failed event was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Republished to the retry topic; `retries` is the new count
    Retry { retries: u32 },

    /// Budget exhausted; published to the dead-letter topic
    DeadLetter { retries: u32 },
}

/// Errors that can occur while escalating a failed event.
#[derive(Debug, Error)]
pub enum EscalationError {
    /// The event resolved to retry/dead-letter plumbing instead of a
    /// business topic
    #[error("refusing to escalate event routed to '{group_id}'/'{topic}'")]
    Misrouted { group_id: String, topic: String },

    #[error("failed to publish to '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: PublishError,
    },
}

/// Decides between retry and dead-letter and republishes accordingly.
#[derive(Clone)]
pub struct Escalator {
    topics: FailureTopics,
    publisher: Arc<Publisher>,
}

impl Escalator {
    /// Create an escalator using the publisher's application name for the
    /// retry and dead-letter topics.
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self {
            topics: FailureTopics::for_app(publisher.app()),
            publisher,
        }
    }

    pub fn topics(&self) -> &FailureTopics {
        &self.topics
    }

    /// Escalate `event`, which failed while routed to `(group_id, topic)`.
    ///
    /// `group_id` / `topic` are the event's business origin: the arriving
    /// group and topic for a fresh event, its `original_*` fields once it is
    /// on the retry path. Existing origin fields are never overwritten.
    pub fn escalate(
        &self,
        event: &mut Envelope,
        group_id: &str,
        topic: &str,
        key: Option<&str>,
    ) -> Result<Escalation, EscalationError> {
        if self.topics.is_reserved_topic(topic) || group_id == self.topics.retry_group {
            return Err(EscalationError::Misrouted {
                group_id: group_id.to_string(),
                topic: topic.to_string(),
            });
        }

        let retries = event.retry_count();

        if retries >= MAX_FAILURES {
            self.publish(self.topics.dead_topic(), event, key)?;
            warn!(
                topic = %topic,
                group_id = %group_id,
                retries = retries,
                dead_topic = %self.topics.dead_topic,
                "Retries exhausted, event moved to dead-letter topic"
            );
            return Ok(Escalation::DeadLetter { retries });
        }

        event.retries = Some(retries + 1);
        event
            .original_topic
            .get_or_insert_with(|| topic.to_string());
        event
            .original_group_id
            .get_or_insert_with(|| group_id.to_string());

        self.publish(self.topics.retry_topic(), event, key)?;
        info!(
            topic = %topic,
            group_id = %group_id,
            retries = retries + 1,
            retry_topic = %self.topics.retry_topic,
            "Event scheduled for retry"
        );

        Ok(Escalation::Retry {
            retries: retries + 1,
        })
    }

    /// Publish `event` unchanged to the dead-letter topic.
    ///
    /// Used for events that cannot be routed back to a handler.
    pub fn dead_letter(&self, event: &Envelope, key: Option<&str>) -> Result<(), EscalationError> {
        self.publish(self.topics.dead_topic(), event, key)?;
        warn!(
            retries = event.retry_count(),
            dead_topic = %self.topics.dead_topic,
            "Event moved to dead-letter topic"
        );
        Ok(())
    }

    fn publish(&self, topic: &str, event: &Envelope, key: Option<&str>) -> Result<(), EscalationError> {
        self.publisher
            .send_filled_data(topic, event, key)
            .map_err(|source| EscalationError::Publish {
                topic: topic.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;

    fn escalator() -> (Escalator, MemoryBroker) {
        let broker = MemoryBroker::new();
        let publisher = Arc::new(Publisher::new("shop", Arc::new(broker.clone())));
        (Escalator::new(publisher), broker)
    }

    fn order() -> Envelope {
        Envelope::new("shop", Some("ns1".to_string()), json!({"uid": 7}))
    }

    #[test]
    fn test_derived_names() {
        let topics = FailureTopics::for_app("shop");
        assert_eq!(topics.retry_topic(), "shop_failure_topic");
        assert_eq!(topics.retry_group(), "shop_failure_consumer");
        assert_eq!(topics.dead_topic(), "shop_dead_topic");
        assert!(topics.is_reserved_topic("shop_dead_topic"));
        assert!(!topics.is_reserved_topic("orders"));
    }

    #[test]
    fn test_collision() {
        let topics = FailureTopics::for_app("shop");
        assert_eq!(topics.collision("g", ["orders", "shop_failure_topic"]), Some("shop_failure_topic"));
        assert_eq!(topics.collision("shop_failure_consumer", ["orders"]), Some("shop_failure_consumer"));
        assert_eq!(topics.collision("g", ["orders"]), None);
    }

    #[test]
    fn test_first_failure_sets_origin() {
        let (escalator, broker) = escalator();
        let mut event = order();

        let outcome = escalator.escalate(&mut event, "billing", "orders", Some("k")).unwrap();
        assert_eq!(outcome, Escalation::Retry { retries: 1 });

        let retried = broker.envelopes("shop_failure_topic");
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].retries, Some(1));
        assert_eq!(retried[0].origin(), Some(("billing", "orders")));
        assert_eq!(retried[0].data, json!({"uid": 7}));
        assert_eq!(broker.records("shop_failure_topic")[0].key.as_deref(), Some("k"));
    }

    #[test]
    fn test_origin_is_never_overwritten() {
        let (escalator, broker) = escalator();
        let mut event = order();
        event.retries = Some(1);
        event.original_topic = Some("orders".to_string());
        event.original_group_id = Some("billing".to_string());

        escalator.escalate(&mut event, "audit", "refunds", None).unwrap();

        let retried = &broker.envelopes("shop_failure_topic")[0];
        assert_eq!(retried.retries, Some(2));
        assert_eq!(retried.origin(), Some(("billing", "orders")));
    }

    #[test]
    fn test_exhausted_event_goes_to_dead_letter_unchanged() {
        let (escalator, broker) = escalator();
        let mut event = order();
        event.retries = Some(MAX_FAILURES);
        event.original_topic = Some("orders".to_string());
        event.original_group_id = Some("billing".to_string());
        let before = event.clone();

        let outcome = escalator.escalate(&mut event, "billing", "orders", None).unwrap();
        assert_eq!(outcome, Escalation::DeadLetter { retries: MAX_FAILURES });
        assert_eq!(event, before);
        assert_eq!(broker.envelopes("shop_dead_topic"), vec![before]);
        assert!(broker.records("shop_failure_topic").is_empty());
    }

    #[test]
    fn test_retry_budget() {
        let (escalator, broker) = escalator();
        let mut event = order();

        let outcomes: Vec<Escalation> = (0..=MAX_FAILURES)
            .map(|_| escalator.escalate(&mut event, "billing", "orders", None).unwrap())
            .collect();

        assert_eq!(
            outcomes,
            vec![
                Escalation::Retry { retries: 1 },
                Escalation::Retry { retries: 2 },
                Escalation::Retry { retries: 3 },
                Escalation::DeadLetter { retries: 3 },
            ]
        );
        assert_eq!(broker.records("shop_failure_topic").len(), 3);
        assert_eq!(broker.records("shop_dead_topic").len(), 1);
    }

    #[test]
    fn test_misrouted_event_is_refused() {
        let (escalator, broker) = escalator();
        let mut event = order();

        let result = escalator.escalate(&mut event, "shop_failure_consumer", "shop_failure_topic", None);
        assert!(matches!(result, Err(EscalationError::Misrouted { .. })));

        let result = escalator.escalate(&mut event, "billing", "shop_dead_topic", None);
        assert!(matches!(result, Err(EscalationError::Misrouted { .. })));

        assert!(event.retries.is_none());
        assert!(broker.records("shop_failure_topic").is_empty());
    }

    #[test]
    fn test_publish_failure_is_reported() {
        let (escalator, broker) = escalator();
        broker.fail_produce_to("shop_failure_topic");
        let mut event = order();

        let result = escalator.escalate(&mut event, "billing", "orders", None);
        assert!(matches!(result, Err(EscalationError::Publish { .. })));
    }
}
