//! eventline-publish - publish a single event
//!
//! ```text
//! eventline-publish <topic> <json-data> [namespace] [key]
//! ```
//!
//! Uses the same configuration as the consumer process (`EVENTLINE_CONFIG`,
//! `APP_NAME`, `KAFKA_BOOTSTRAP_SERVERS`).

use serde_json::Value;
use std::env;
use std::process;
use std::sync::Arc;
use tracing::info;

use eventline::config::EventlineConfig;
use eventline::kafka::KafkaProducer;
use eventline::publisher;

const USAGE: &str = "usage: eventline-publish <topic> <json-data> [namespace] [key]";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let mut args = env::args().skip(1);
    let (Some(topic), Some(data)) = (args.next(), args.next()) else {
        eprintln!("{}", USAGE);
        process::exit(2);
    };
    let namespace = args.next().filter(|ns| !ns.is_empty());
    let key = args.next();

    let data: Value = serde_json::from_str(&data)?;

    let config = EventlineConfig::load()?;
    let producer = KafkaProducer::new(&config.kafka, &config.producer)?;
    let publisher = publisher::init(&config.app.name, Arc::new(producer))?;

    publisher::send(&topic, namespace.as_deref(), data, key.as_deref());
    publisher.close(config.producer.flush_timeout());

    info!(topic = %topic, namespace = ?namespace, "Event published");
    Ok(())
}
