//! Event publisher.
//!
//! The [`Publisher`] wraps business data in an [`Envelope`] and hands it to
//! an [`EventSink`] without waiting for the broker. It is fire-and-forget:
//! enqueue and delivery failures are logged, never returned, from
//! [`Publisher::send`].
//!
//! A process usually installs one publisher with [`init`] during startup and
//! publishes through [`send`]; components that need one explicitly (the
//! orchestrator, tests) take an `Arc<Publisher>`.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventline::publisher;
//! use serde_json::json;
//!
//! publisher::init("shop", Arc::new(kafka_producer))?;
//! publisher::send("orders", Some("ns1"), json!({"uid": 7}), None);
//! ```

use crate::broker::{BrokerError, EventSink};
use crate::event::Envelope;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

static GLOBAL: OnceLock<Arc<Publisher>> = OnceLock::new();

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher is already initialized")]
    AlreadyInitialized,

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Builds envelopes and hands them to the broker.
pub struct Publisher {
    app: String,
    sink: Arc<dyn EventSink>,
}

impl Publisher {
    pub fn new(app: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            app: app.into(),
            sink,
        }
    }

    /// Application name stamped into every envelope.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Publish `data` to `topic`. Never fails; problems are logged.
    pub fn send(&self, topic: &str, namespace: Option<&str>, data: Value, key: Option<&str>) {
        let envelope = Envelope::new(&self.app, namespace.map(str::to_string), data);

        if let Err(e) = self.send_filled_data(topic, &envelope, key) {
            error!(
                topic = %topic,
                namespace = ?namespace,
                error = %e,
                "Failed to publish event"
            );
        }
    }

    /// Publish an already-enveloped event verbatim, retry metadata included.
    pub fn send_filled_data(
        &self,
        topic: &str,
        event: &Envelope,
        key: Option<&str>,
    ) -> Result<(), PublishError> {
        let payload = event.to_vec()?;
        self.sink.produce(topic, key, &payload)?;

        debug!(topic = %topic, key = ?key, bytes = payload.len(), "Event handed to broker");
        Ok(())
    }

    /// Wait for outstanding deliveries.
    pub fn close(&self, timeout: Duration) {
        match self.sink.flush(timeout) {
            Ok(()) => info!("Publisher flushed"),
            Err(e) => warn!(error = %e, timeout_secs = timeout.as_secs(), "Publisher flush incomplete"),
        }
    }
}

/// Install the process-wide publisher. Fails if called twice.
pub fn init(app: impl Into<String>, sink: Arc<dyn EventSink>) -> Result<Arc<Publisher>, PublishError> {
    let publisher = Arc::new(Publisher::new(app, sink));
    GLOBAL
        .set(Arc::clone(&publisher))
        .map_err(|_| PublishError::AlreadyInitialized)?;

    info!(app = %publisher.app(), "Publisher initialized");
    Ok(publisher)
}

/// The process-wide publisher, if [`init`] has run.
pub fn global() -> Option<Arc<Publisher>> {
    GLOBAL.get().cloned()
}

/// Publish through the process-wide publisher.
///
/// Logs and drops the event when [`init`] has not run yet.
pub fn send(topic: &str, namespace: Option<&str>, data: Value, key: Option<&str>) {
    match GLOBAL.get() {
        Some(publisher) => publisher.send(topic, namespace, data, key),
        None => info!(topic = %topic, "Publisher is not initialized yet, event dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;

    #[test]
    fn test_send_wraps_data_in_envelope() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new("shop", Arc::new(broker.clone()));

        publisher.send("orders", Some("ns1"), json!({"uid": 7}), Some("user-7"));

        let records = broker.records("orders");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some("user-7"));

        let event = &broker.envelopes("orders")[0];
        assert_eq!(event.app, "shop");
        assert_eq!(event.namespace.as_deref(), Some("ns1"));
        assert_eq!(event.data, json!({"uid": 7}));
        assert!(event.trace.is_none());
        assert!(event.ts > 0);
    }

    #[test]
    fn test_send_swallows_broker_errors() {
        let broker = MemoryBroker::new();
        broker.fail_produce_to("orders");
        let publisher = Publisher::new("shop", Arc::new(broker.clone()));

        publisher.send("orders", None, json!({}), None);
        assert!(broker.records("orders").is_empty());
    }

    #[test]
    fn test_send_filled_data_is_verbatim() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new("shop", Arc::new(broker.clone()));

        let mut event = Envelope::new("upstream", Some("ns1".to_string()), json!({"uid": 7}));
        event.retries = Some(2);
        event.original_topic = Some("orders".to_string());
        event.original_group_id = Some("billing".to_string());

        publisher.send_filled_data("retry", &event, None).unwrap();
        assert_eq!(broker.envelopes("retry"), vec![event]);
    }

    #[test]
    fn test_send_filled_data_reports_errors() {
        let broker = MemoryBroker::new();
        broker.fail_produce_to("retry");
        let publisher = Publisher::new("shop", Arc::new(broker));

        let event = Envelope::new("shop", None, json!({}));
        let result = publisher.send_filled_data("retry", &event, None);
        assert!(matches!(result, Err(PublishError::Broker(BrokerError::Enqueue { .. }))));
    }

    #[test]
    fn test_global_publisher() {
        // Before init the global send is a no-op.
        send("orders", None, json!({}), None);

        let broker = MemoryBroker::new();
        let publisher = init("shop", Arc::new(broker.clone())).unwrap();
        assert!(Arc::ptr_eq(&publisher, &global().unwrap()));

        send("orders", Some("ns1"), json!({"uid": 1000}), None);
        assert_eq!(broker.envelopes("orders").len(), 1);

        assert!(matches!(
            init("shop", Arc::new(broker)),
            Err(PublishError::AlreadyInitialized)
        ));
    }
}
