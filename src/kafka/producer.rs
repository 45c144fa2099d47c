use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::{ClientContext, Message};
use std::time::Duration;
use tracing::{debug, error, info};

use super::config::create_client_config;
use crate::broker::{BrokerError, EventSink};
use crate::config::{KafkaConfig, ProducerConfig};

/// Logs the outcome of every delivery. Failures are never surfaced to the
/// caller of `send`.
pub struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(message) => {
                debug!(
                    topic = %message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Event delivered"
                );
            }
            Err((e, message)) => {
                error!(
                    error = %e,
                    topic = %message.topic(),
                    "Event delivery failed"
                );
            }
        }
    }
}

/// Kafka producer used by the publisher and the escalator.
///
/// `produce` only enqueues; the delivery callback queue is drained with a
/// zero-timeout poll after every send so the caller never blocks.
pub struct KafkaProducer {
    producer: BaseProducer<DeliveryLogger>,
}

impl KafkaProducer {
    /// Create a producer from the connection and producer settings.
    ///
    /// # Configuration
    /// - `acks=all`: Wait for all in-sync replicas to acknowledge.
    /// - `message.timeout.ms`: How long librdkafka keeps retrying a message
    ///   before reporting it as failed.
    pub fn new(kafka: &KafkaConfig, producer: &ProducerConfig) -> Result<Self, BrokerError> {
        let mut client_config = create_client_config(kafka, &kafka.brokers);

        let producer: BaseProducer<DeliveryLogger> = client_config
            .set("acks", "all")
            .set("message.timeout.ms", producer.message_timeout_ms.to_string())
            .create_with_context(DeliveryLogger)
            .map_err(|e| BrokerError::Client(format!("failed to create producer: {}", e)))?;

        info!(brokers = ?kafka.brokers, "Kafka producer initialized");

        Ok(Self { producer })
    }
}

impl EventSink for KafkaProducer {
    fn produce(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), BrokerError> {
        let mut record = BaseRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let result = self.producer.send(record).map_err(|(e, _)| BrokerError::Enqueue {
            topic: topic.to_string(),
            reason: e.to_string(),
        });

        self.producer.poll(Duration::ZERO);
        result
    }

    fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer
            .flush(timeout)
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}
