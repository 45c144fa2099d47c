use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::config::create_client_config;
use crate::broker::{BrokerError, ConsumerFactory, Delivery, EventConsumer, WorkerConfig};
use crate::config::KafkaConfig;

/// Logs partition assignments and commit results for one consumer group.
pub struct DiagnosticsContext {
    group_id: String,
}

impl ClientContext for DiagnosticsContext {}

impl ConsumerContext for DiagnosticsContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                for elem in partitions.elements() {
                    info!(
                        group_id = %self.group_id,
                        topic = %elem.topic(),
                        partition = elem.partition(),
                        "Partition assigned"
                    );
                }
            }
            Rebalance::Revoke(partitions) => {
                info!(
                    group_id = %self.group_id,
                    partitions = partitions.count(),
                    "Partitions revoked"
                );
            }
            Rebalance::Error(e) => {
                warn!(group_id = %self.group_id, error = %e, "Rebalance failed");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                for elem in offsets.elements() {
                    debug!(
                        group_id = %self.group_id,
                        topic = %elem.topic(),
                        partition = elem.partition(),
                        offset = ?elem.offset(),
                        "Offset committed"
                    );
                }
            }
            Err(e) => {
                error!(group_id = %self.group_id, error = %e, "Offset commit failed");
                for elem in offsets.elements() {
                    error!(
                        group_id = %self.group_id,
                        topic = %elem.topic(),
                        partition = elem.partition(),
                        error = ?elem.error(),
                        "Partition commit error"
                    );
                }
            }
        }
    }
}

/// Kafka consumer owned by one worker.
///
/// This consumer is configured for:
/// - Manual offset commits, one message at a time
/// - `earliest` offset reset for groups without committed offsets
/// - Consumer group coordination handled by the broker
pub struct KafkaConsumer {
    consumer: Option<BaseConsumer<DiagnosticsContext>>,
    group_id: String,
}

impl KafkaConsumer {
    /// Create a consumer and subscribe it to the worker's topics.
    ///
    /// # Configuration
    /// - `enable.auto.commit=false`: Manual offset management.
    /// - `auto.offset.reset=earliest`: Read from beginning on first start.
    /// - `session.timeout.ms=30000`: 30s session timeout.
    /// - `max.poll.interval.ms=300000`: 5min max handler time per message.
    pub fn new(kafka: &KafkaConfig, config: &WorkerConfig) -> Result<Self, BrokerError> {
        let mut client_config = create_client_config(kafka, &config.brokers);

        let consumer: BaseConsumer<DiagnosticsContext> = client_config
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("allow.auto.create.topics", "true")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .create_with_context(DiagnosticsContext {
                group_id: config.group_id.clone(),
            })
            .map_err(|e| BrokerError::Client(format!("failed to create consumer: {}", e)))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Client(format!("failed to subscribe: {}", e)))?;

        info!(
            group_id = %config.group_id,
            topics = ?config.topics,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer: Some(consumer),
            group_id: config.group_id.clone(),
        })
    }

    fn inner(&self) -> Result<&BaseConsumer<DiagnosticsContext>, BrokerError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| BrokerError::Fatal(format!("consumer for '{}' is closed", self.group_id)))
    }
}

impl EventConsumer for KafkaConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        match self.inner()?.poll(timeout) {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(Delivery {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
            Some(Err(e)) => Err(classify(e)),
        }
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset + 1),
            )
            .map_err(classify)?;

        self.inner()?
            .commit(&offsets, CommitMode::Async)
            .map_err(classify)
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            drop(consumer);
            info!(group_id = %self.group_id, "Kafka consumer closed");
        }
    }
}

/// Fatal librdkafka errors stop the worker; everything else is retried by
/// polling again.
fn classify(error: KafkaError) -> BrokerError {
    if error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
        BrokerError::Fatal(error.to_string())
    } else {
        BrokerError::Transient(error.to_string())
    }
}

/// Opens [`KafkaConsumer`]s with shared connection settings.
#[derive(Debug, Clone)]
pub struct KafkaConsumerFactory {
    kafka: KafkaConfig,
}

impl KafkaConsumerFactory {
    pub fn new(kafka: KafkaConfig) -> Self {
        Self { kafka }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create(&self, config: &WorkerConfig) -> Result<Box<dyn EventConsumer>, BrokerError> {
        Ok(Box::new(KafkaConsumer::new(&self.kafka, config)?))
    }
}
