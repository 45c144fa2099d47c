//! Kafka implementation of the broker seam.
//!
//! Consumers are `rdkafka` [`BaseConsumer`](rdkafka::consumer::BaseConsumer)s
//! polled synchronously from their worker thread; the producer is a
//! [`BaseProducer`](rdkafka::producer::BaseProducer) whose delivery callbacks
//! are drained with a non-blocking poll after every send.

pub mod config;
pub mod consumer;
pub mod producer;

pub use config::{create_client_config, default_client_id};
pub use consumer::{KafkaConsumer, KafkaConsumerFactory};
pub use producer::KafkaProducer;
