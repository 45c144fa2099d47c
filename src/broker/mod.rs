//! Broker seam.
//!
//! Workers and the publisher talk to the message broker only through the
//! traits in this module:
//!
//! - [`EventConsumer`]: bounded poll plus manual per-message commit
//! - [`EventSink`]: fire-and-forget produce plus flush
//! - [`ConsumerFactory`]: opens a subscribed consumer for a [`WorkerConfig`]
//!
//! [`crate::kafka`] implements them on top of `rdkafka`; [`memory`] keeps
//! everything in-process for tests and local runs.

pub mod memory;

use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryBroker;

/// Errors reported by broker clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Poll or commit hiccup; the worker logs it and keeps going
    #[error("transient broker error: {0}")]
    Transient(String),

    /// The client cannot continue; the worker exits
    #[error("fatal broker error: {0}")]
    Fatal(String),

    /// Consumer or producer could not be created or subscribed
    #[error("failed to create broker client: {0}")]
    Client(String),

    /// The producer refused to enqueue a message
    #[error("failed to enqueue message for topic '{topic}': {reason}")]
    Enqueue { topic: String, reason: String },

    /// Outstanding deliveries were not acknowledged in time
    #[error("flush did not complete: {0}")]
    Flush(String),
}

impl BrokerError {
    /// Whether the consumer that produced this error must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Client(_))
    }
}

/// A message fetched from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

impl Delivery {
    /// The message key, if present and valid UTF-8.
    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_deref()
            .and_then(|key| std::str::from_utf8(key).ok())
    }
}

/// What a worker needs to open its consumer.
///
/// Offsets are always committed manually, one message at a time, and a
/// group without committed offsets starts from the earliest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Bootstrap broker addresses
    pub brokers: Vec<String>,

    /// Consumer group id
    pub group_id: String,

    /// Topics to subscribe to
    pub topics: Vec<String>,
}

/// A subscribed consumer owned by exactly one worker thread.
pub trait EventConsumer: Send {
    /// Wait up to `timeout` for the next message.
    ///
    /// `Ok(None)` means the timeout elapsed without a message.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Commit the offset following `delivery` for its partition.
    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Leave the consumer group and release the client.
    fn close(&mut self);
}

/// Destination for published events, shared by every thread.
pub trait EventSink: Send + Sync {
    /// Enqueue `payload` for `topic` without waiting for the broker.
    fn produce(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), BrokerError>;

    /// Block until outstanding messages are delivered or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// Opens consumers for workers.
pub trait ConsumerFactory: Send + Sync {
    fn create(&self, config: &WorkerConfig) -> Result<Box<dyn EventConsumer>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BrokerError::Fatal("gone".into()).is_fatal());
        assert!(BrokerError::Client("bad config".into()).is_fatal());
        assert!(!BrokerError::Transient("rebalancing".into()).is_fatal());
        assert!(!BrokerError::Flush("timed out".into()).is_fatal());
    }

    #[test]
    fn test_key_str() {
        let mut delivery = Delivery {
            topic: "orders".to_string(),
            partition: 0,
            offset: 4,
            key: Some(b"user-7".to_vec()),
            payload: None,
        };
        assert_eq!(delivery.key_str(), Some("user-7"));

        delivery.key = Some(vec![0xff, 0xfe]);
        assert_eq!(delivery.key_str(), None);

        delivery.key = None;
        assert_eq!(delivery.key_str(), None);
    }
}
