//! # eventline
//!
//! At-least-once Kafka event consumption with bounded retry and dead-letter
//! escalation.
//!
//! ## Architecture
//!
//! ```text
//! Publisher -> topic -> ConsumerWorker -> Handlers
//!                             |
//!                             +-- failure --> {app}_failure_topic -> retry worker -> Handlers
//!                                                  |
//!                                                  +-- budget spent --> {app}_dead_topic
//! ```
//!
//! ## Modules
//!
//! - [`event`]: The wire envelope shared by publishers and workers
//! - [`publisher`]: Fire-and-forget publishing
//! - [`registry`]: Consumer group to handler bindings
//! - [`handlers`]: Handler trait and built-in handlers
//! - [`worker`]: Per-group poll, dispatch and commit loop
//! - [`escalation`]: Retry and dead-letter republishing
//! - [`orchestrator`]: Runs every worker until shutdown
//! - [`broker`]: Broker seam plus an in-process implementation
//! - [`kafka`]: `rdkafka` implementation of the broker seam

pub mod broker;
pub mod config;
pub mod escalation;
pub mod event;
pub mod handlers;
pub mod kafka;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
pub mod shutdown;
pub mod worker;

use std::time::Duration;

// Re-export commonly used types at crate root
pub use escalation::{Escalation, Escalator, FailureTopics};
pub use event::Envelope;
pub use handlers::{FnHandler, Handler, HandlerError, LogHandler};
pub use orchestrator::{Orchestrator, OrchestratorReport};
pub use publisher::Publisher;
pub use registry::{ListenerItem, ListenerRegistry};
pub use shutdown::ShutdownSignal;
pub use worker::{ConsumerWorker, WorkerSettings, WorkerStats};

/// Failed attempts an event may accumulate before it is dead-lettered
pub const MAX_FAILURES: u32 = 3;

/// Upper bound on the pause a worker takes after consecutive failures
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// How long a single poll waits for a message
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);
