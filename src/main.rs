//! eventline - Kafka consumer process
//!
//! Runs one consumer thread per configured listener group plus the retry
//! worker until SIGTERM or Ctrl+C.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `EVENTLINE_CONFIG`: Path to the TOML config (default: "config/eventline.toml")
//! - `APP_NAME`: Application name when the config file does not set one (default: "Kafka")
//! - `KAFKA_BOOTSTRAP_SERVERS`: Comma separated broker list, overrides the config file
//! - `RUST_LOG`: Logging level (default: "info")

use std::sync::Arc;
use tracing::{error, info, warn};

use eventline::config::EventlineConfig;
use eventline::kafka::{KafkaConsumerFactory, KafkaProducer};
use eventline::orchestrator::{Orchestrator, WorkerExit};
use eventline::publisher;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = EventlineConfig::load()?;
    let registry = config.build_registry()?;

    info!(
        app = %config.app.name,
        groups = ?registry.groups(),
        "eventline starting"
    );

    if registry.is_empty() {
        warn!("No listeners configured; add [[listeners]] entries to consume business topics");
    }

    let producer = KafkaProducer::new(&config.kafka, &config.producer)?;
    let publisher = publisher::init(&config.app.name, Arc::new(producer))?;
    let factory = KafkaConsumerFactory::new(config.kafka.clone());

    let orchestrator = Orchestrator::new(
        registry,
        publisher,
        Arc::new(factory),
        config.kafka.brokers.clone(),
    )
    .with_settings(config.worker.settings())
    .with_flush_timeout(config.producer.flush_timeout());

    let report = orchestrator.start()?;

    for worker in &report.workers {
        match &worker.exit {
            WorkerExit::Stopped(stats) => info!(
                group_id = %worker.group_id,
                processed = stats.processed,
                failed = stats.failed,
                dropped = stats.dropped,
                "Worker finished"
            ),
            WorkerExit::Failed(e) => error!(
                group_id = %worker.group_id,
                error = %e,
                "Worker failed"
            ),
            WorkerExit::Panicked(message) => error!(
                group_id = %worker.group_id,
                panic = %message,
                "Worker panicked"
            ),
        }
    }

    if report.has_failures() {
        return Err("one or more workers stopped with an error".into());
    }

    info!("eventline stopped");
    Ok(())
}
