//! Consumer worker.
//!
//! A [`ConsumerWorker`] owns one broker consumer for one consumer group and
//! runs on its own thread:
//!
//! ```text
//! Init -> Subscribed -> (poll -> dispatch -> commit -> backoff)* -> ShuttingDown -> Closed
//! ```
//!
//! Every polled message is committed exactly once, whatever happened to it:
//! handled, unrouted, malformed or escalated. Handler failures never reach
//! the poll loop; they are turned into retry or dead-letter publishes by the
//! [`Escalator`].

use crate::broker::{BrokerError, ConsumerFactory, Delivery, EventConsumer, WorkerConfig};
use crate::escalation::{Escalation, Escalator};
use crate::event::Envelope;
use crate::handlers::{Handler, HandlerError};
use crate::registry::ListenerRegistry;
use crate::shutdown::ShutdownSignal;
use crate::{MAX_BACKOFF, POLL_TIMEOUT};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

/// Log worker statistics every this many messages.
const STATS_INTERVAL: u64 = 100;

/// Poll and backoff timings for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Upper bound on a single poll
    pub poll_timeout: Duration,

    /// Upper bound on the post-dispatch pause
    pub max_backoff: Duration,

    /// Pause added per consecutive failure
    pub backoff_unit: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: POLL_TIMEOUT,
            max_backoff: MAX_BACKOFF,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl WorkerSettings {
    /// Pause after a dispatch, given the number of consecutive failures.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(consecutive_failures)
            .min(self.max_backoff)
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Subscribed,
    Polling,
    ShuttingDown,
    Closed,
}

/// Counters reported when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages whose handlers all succeeded, or that no handler wanted
    pub processed: u64,

    /// Messages with a failing handler
    pub failed: u64,

    /// Empty, undecodable or unroutable messages
    pub dropped: u64,
}

impl WorkerStats {
    pub fn total(&self) -> u64 {
        self.processed + self.failed + self.dropped
    }

    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled { .. } | DispatchOutcome::Unrouted => self.processed += 1,
            DispatchOutcome::Escalated(_) | DispatchOutcome::EscalationFailed => self.failed += 1,
            DispatchOutcome::Empty | DispatchOutcome::Malformed | DispatchOutcome::Orphaned => {
                self.dropped += 1
            }
        }
    }
}

/// Errors that stop a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to open consumer for group '{group_id}': {source}")]
    Consumer {
        group_id: String,
        #[source]
        source: BrokerError,
    },

    #[error("consumer for group '{group_id}' failed: {source}")]
    Fatal {
        group_id: String,
        #[source]
        source: BrokerError,
    },
}

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    /// Every matching handler succeeded
    Handled { handlers: usize },

    /// No listener matched the routing target and namespace
    Unrouted,

    /// Missing or blank payload
    Empty,

    /// Payload was not a JSON envelope
    Malformed,

    /// Retry traffic without a full origin, moved to the dead-letter topic
    Orphaned,

    /// A handler failed and the event was republished
    Escalated(Escalation),

    /// A handler failed and the republish did not happen
    EscalationFailed,
}

impl DispatchOutcome {
    fn is_failure(&self) -> bool {
        matches!(self, Self::Escalated(_) | Self::EscalationFailed)
    }

    /// Whether the worker pauses before its next poll.
    fn backs_off(&self) -> bool {
        !matches!(self, Self::Empty | Self::Malformed | Self::Orphaned)
    }
}

/// Polls one consumer group and dispatches its events.
pub struct ConsumerWorker {
    group_id: String,
    topics: Vec<String>,
    brokers: Vec<String>,
    registry: Arc<ListenerRegistry>,
    escalator: Escalator,
    settings: WorkerSettings,
    shutdown: ShutdownSignal,
}

impl ConsumerWorker {
    /// Worker for a registered group, subscribed to every topic its
    /// listeners named.
    pub fn business(
        group_id: &str,
        brokers: Vec<String>,
        registry: Arc<ListenerRegistry>,
        escalator: Escalator,
        settings: WorkerSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let topics = registry.topics_for(group_id).into_iter().collect();

        Self {
            group_id: group_id.to_string(),
            topics,
            brokers,
            registry,
            escalator,
            settings,
            shutdown,
        }
    }

    /// Worker for the application's retry topic.
    ///
    /// Events arriving here are routed by their `original_group_id` /
    /// `original_topic` to the listeners that first failed on them.
    pub fn escalation(
        brokers: Vec<String>,
        registry: Arc<ListenerRegistry>,
        escalator: Escalator,
        settings: WorkerSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let topics = escalator.topics();

        Self {
            group_id: topics.retry_group().to_string(),
            topics: vec![topics.retry_topic().to_string()],
            brokers,
            registry,
            escalator,
            settings,
            shutdown,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Consumer settings for this worker.
    pub fn config(&self) -> WorkerConfig {
        WorkerConfig {
            brokers: self.brokers.clone(),
            group_id: self.group_id.clone(),
            topics: self.topics.clone(),
        }
    }

    /// Run until shutdown or a fatal broker error.
    ///
    /// The consumer is closed on every exit path.
    pub fn run(self, factory: &dyn ConsumerFactory) -> Result<WorkerStats, WorkerError> {
        let span = info_span!("worker", group = %self.group_id);
        let _enter = span.enter();

        let mut state = WorkerState::Init;
        info!(topics = ?self.topics, "Starting consumer worker");

        let mut consumer = factory
            .create(&self.config())
            .map_err(|source| {
                error!(error = %source, "Failed to open consumer");
                WorkerError::Consumer {
                    group_id: self.group_id.clone(),
                    source,
                }
            })?;
        transition(&mut state, WorkerState::Subscribed);

        let mut stats = WorkerStats::default();
        let result = self.poll_loop(consumer.as_mut(), &mut state, &mut stats);

        transition(&mut state, WorkerState::ShuttingDown);
        consumer.close();
        transition(&mut state, WorkerState::Closed);

        match &result {
            Ok(()) => info!(
                processed = stats.processed,
                failed = stats.failed,
                dropped = stats.dropped,
                "Worker stopped"
            ),
            Err(e) => error!(
                error = %e,
                processed = stats.processed,
                failed = stats.failed,
                dropped = stats.dropped,
                "Worker stopped on fatal error"
            ),
        }

        result.map(|()| stats)
    }

    fn poll_loop(
        &self,
        consumer: &mut dyn EventConsumer,
        state: &mut WorkerState,
        stats: &mut WorkerStats,
    ) -> Result<(), WorkerError> {
        let mut consecutive_failures: u32 = 0;
        transition(state, WorkerState::Polling);

        loop {
            if self.shutdown.is_shutdown() {
                info!("Shutdown signal received, stopping worker");
                return Ok(());
            }

            let delivery = match consumer.poll(self.settings.poll_timeout) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => return Err(self.fatal(e)),
                Err(e) => {
                    warn!(error = %e, "Poll failed, will retry");
                    continue;
                }
            };

            let outcome = self.dispatch(&delivery);
            stats.record(&outcome);

            if outcome.is_failure() {
                consecutive_failures = consecutive_failures.saturating_add(1);
            } else if outcome.backs_off() {
                consecutive_failures = 0;
            }

            match consumer.commit(&delivery) {
                Ok(()) => debug!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Offset committed"
                ),
                Err(e) if e.is_fatal() => return Err(self.fatal(e)),
                Err(e) => warn!(
                    error = %e,
                    topic = %delivery.topic,
                    offset = delivery.offset,
                    "Commit failed"
                ),
            }

            if stats.total() % STATS_INTERVAL == 0 {
                info!(
                    processed = stats.processed,
                    failed = stats.failed,
                    dropped = stats.dropped,
                    "Worker progress"
                );
            }

            if outcome.backs_off() {
                let pause = self.settings.backoff(consecutive_failures);
                if !pause.is_zero() {
                    debug!(
                        consecutive_failures = consecutive_failures,
                        pause_ms = pause.as_millis() as u64,
                        "Backing off"
                    );
                    self.shutdown.sleep(pause);
                }
            }
        }
    }

    fn fatal(&self, source: BrokerError) -> WorkerError {
        WorkerError::Fatal {
            group_id: self.group_id.clone(),
            source,
        }
    }

    /// An event on the retry topic must name the group and topic it failed
    /// in; without both it cannot be routed back to a handler.
    fn orphan(&self, event: &Envelope, delivery: &Delivery) -> DispatchOutcome {
        error!(
            topic = %delivery.topic,
            offset = delivery.offset,
            original_topic = ?event.original_topic,
            original_group_id = ?event.original_group_id,
            "Retry event has no complete origin, moving it to the dead-letter topic"
        );

        if let Err(e) = self.escalator.dead_letter(event, delivery.key_str()) {
            error!(error = %e, event = ?event, "Failed to dead-letter event, dropping it");
        }

        DispatchOutcome::Orphaned
    }

    /// Decode, route and handle one message. Never fails; the caller commits
    /// whatever the outcome.
    fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let Some(payload) = delivery
            .payload
            .as_deref()
            .filter(|payload| !payload.iter().all(u8::is_ascii_whitespace))
        else {
            warn!(
                topic = %delivery.topic,
                offset = delivery.offset,
                "Empty payload, skipping"
            );
            return DispatchOutcome::Empty;
        };

        let mut event = match Envelope::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    topic = %delivery.topic,
                    offset = delivery.offset,
                    payload = %String::from_utf8_lossy(payload),
                    "Malformed payload, skipping"
                );
                return DispatchOutcome::Malformed;
            }
        };

        let (group_id, topic) = match event.origin() {
            Some((group, topic)) => (group.to_string(), topic.to_string()),
            None if self.group_id == self.escalator.topics().retry_group() => {
                return self.orphan(&event, delivery);
            }
            None => (self.group_id.clone(), delivery.topic.clone()),
        };

        let mut handlers = 0;
        let mut failure = None;

        for item in self
            .registry
            .matching(&group_id, &topic, event.namespace.as_deref())
        {
            handlers += 1;
            if let Err(e) = invoke(item.handler().as_ref(), &event) {
                failure = Some((item.handler().name().to_string(), e));
                break;
            }
        }

        let Some((handler, e)) = failure else {
            if handlers == 0 {
                debug!(
                    group_id = %group_id,
                    topic = %topic,
                    namespace = ?event.namespace,
                    "No listener matched event"
                );
                return DispatchOutcome::Unrouted;
            }
            return DispatchOutcome::Handled { handlers };
        };

        error!(
            handler = %handler,
            error = %e,
            group_id = %group_id,
            topic = %topic,
            retries = event.retry_count(),
            "Handler failed"
        );

        match self
            .escalator
            .escalate(&mut event, &group_id, &topic, delivery.key_str())
        {
            Ok(escalation) => DispatchOutcome::Escalated(escalation),
            Err(e) => {
                error!(
                    error = %e,
                    event = ?event,
                    "Failed to escalate event, dropping it"
                );
                DispatchOutcome::EscalationFailed
            }
        }
    }
}

fn transition(state: &mut WorkerState, next: WorkerState) {
    debug!(from = ?state, to = ?next, "Worker state changed");
    *state = next;
}

/// Run a handler, turning a panic into a [`HandlerError::Panicked`].
fn invoke(handler: &dyn Handler, event: &Envelope) -> Result<(), HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::handlers::FnHandler;
    use crate::publisher::Publisher;
    use serde_json::json;
    use std::sync::Mutex;
    use std::thread;

    const NO_NS: Option<&[&str]> = None;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            poll_timeout: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
            backoff_unit: Duration::from_millis(1),
        }
    }

    fn escalator(broker: &MemoryBroker) -> Escalator {
        Escalator::new(Arc::new(Publisher::new("shop", Arc::new(broker.clone()))))
    }

    fn recorder(name: &str, seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Handler> {
        let seen = Arc::clone(seen);
        let label = name.to_string();
        Arc::new(FnHandler::new(name, move |_event: &Envelope| {
            seen.lock().unwrap().push(label.clone());
            Ok(())
        }))
    }

    fn failing(name: &str) -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(name, |_event: &Envelope| {
            Err(HandlerError::failed("boom"))
        }))
    }

    fn business(broker: &MemoryBroker, group: &str, registry: ListenerRegistry) -> ConsumerWorker {
        ConsumerWorker::business(
            group,
            vec!["memory".to_string()],
            Arc::new(registry),
            escalator(broker),
            settings(),
            ShutdownSignal::new(),
        )
    }

    fn delivery(topic: &str, payload: &[u8]) -> Delivery {
        Delivery {
            topic: topic.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: Some(payload.to_vec()),
        }
    }

    fn order_payload(namespace: Option<&str>) -> Vec<u8> {
        Envelope::new("shop", namespace.map(str::to_string), json!({"uid": 7}))
            .to_vec()
            .unwrap()
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.backoff(0), Duration::ZERO);
        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(4), Duration::from_secs(4));
        assert_eq!(settings.backoff(10), Duration::from_secs(10));
        assert_eq!(settings.backoff(250), Duration::from_secs(10));
    }

    #[test]
    fn test_worker_topics() {
        let broker = MemoryBroker::new();
        let mut registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry.register("g", &["refunds"], NO_NS, recorder("a", &seen)).unwrap();
        registry.register("g", &["orders"], NO_NS, recorder("b", &seen)).unwrap();

        let worker = business(&broker, "g", registry);
        assert_eq!(worker.topics(), ["orders", "refunds"]);
        assert_eq!(worker.config().group_id, "g");

        let retry = ConsumerWorker::escalation(
            vec!["memory".to_string()],
            Arc::new(ListenerRegistry::new()),
            escalator(&broker),
            settings(),
            ShutdownSignal::new(),
        );
        assert_eq!(retry.group_id(), "shop_failure_consumer");
        assert_eq!(retry.topics(), ["shop_failure_topic"]);
    }

    #[test]
    fn test_dispatch_runs_handlers_in_order() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], NO_NS, recorder("first", &seen)).unwrap();
        registry.register("g", &["orders"], NO_NS, recorder("second", &seen)).unwrap();
        registry.register("g", &["refunds"], NO_NS, recorder("other", &seen)).unwrap();

        let worker = business(&broker, "g", registry);
        let outcome = worker.dispatch(&delivery("orders", &order_payload(None)));

        assert_eq!(outcome, DispatchOutcome::Handled { handlers: 2 });
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_dispatch_skips_empty_and_malformed() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], NO_NS, recorder("a", &seen)).unwrap();
        let worker = business(&broker, "g", registry);

        assert_eq!(worker.dispatch(&delivery("orders", b"")), DispatchOutcome::Empty);
        assert_eq!(worker.dispatch(&delivery("orders", b"  \n")), DispatchOutcome::Empty);

        let mut missing = delivery("orders", b"");
        missing.payload = None;
        assert_eq!(worker.dispatch(&missing), DispatchOutcome::Empty);

        assert_eq!(worker.dispatch(&delivery("orders", b"not json")), DispatchOutcome::Malformed);
        assert_eq!(worker.dispatch(&delivery("orders", &[0xff, 0xfe])), DispatchOutcome::Malformed);
        assert_eq!(worker.dispatch(&delivery("orders", b"[1, 2]")), DispatchOutcome::Malformed);

        assert!(seen.lock().unwrap().is_empty());
        assert!(broker.records("shop_failure_topic").is_empty());
        assert!(broker.records("shop_dead_topic").is_empty());
    }

    #[test]
    fn test_dispatch_failure_is_escalated() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("billing", &["orders"], NO_NS, failing("charge")).unwrap();
        registry.register("billing", &["orders"], NO_NS, recorder("after", &seen)).unwrap();

        let worker = business(&broker, "billing", registry);
        let mut message = delivery("orders", &order_payload(Some("ns1")));
        message.key = Some(b"user-7".to_vec());

        let outcome = worker.dispatch(&message);
        assert_eq!(outcome, DispatchOutcome::Escalated(Escalation::Retry { retries: 1 }));

        // Handlers after the failing one are skipped.
        assert!(seen.lock().unwrap().is_empty());

        let retried = broker.envelopes("shop_failure_topic");
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].origin(), Some(("billing", "orders")));
        assert_eq!(retried[0].namespace.as_deref(), Some("ns1"));
        assert_eq!(broker.records("shop_failure_topic")[0].key.as_deref(), Some("user-7"));
    }

    #[test]
    fn test_dispatch_catches_panics() {
        let broker = MemoryBroker::new();
        let mut registry = ListenerRegistry::new();
        let panicking: Arc<dyn Handler> = Arc::new(FnHandler::new(
            "panicky",
            |_event: &Envelope| -> Result<(), HandlerError> { panic!("handler exploded") },
        ));
        registry.register("g", &["orders"], NO_NS, panicking).unwrap();

        let worker = business(&broker, "g", registry);
        let outcome = worker.dispatch(&delivery("orders", &order_payload(None)));

        assert_eq!(outcome, DispatchOutcome::Escalated(Escalation::Retry { retries: 1 }));
        assert_eq!(broker.envelopes("shop_failure_topic").len(), 1);
    }

    #[test]
    fn test_invoke_reports_panic_message() {
        let handler = FnHandler::new("panicky", |_event: &Envelope| -> Result<(), HandlerError> {
            panic!("handler exploded")
        });
        let event = Envelope::new("shop", None, json!({}));

        match invoke(&handler, &event) {
            Err(HandlerError::Panicked(message)) => assert_eq!(message, "handler exploded"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_respects_namespaces() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], Some(&["B"][..]), recorder("b-only", &seen)).unwrap();

        let worker = business(&broker, "g", registry);

        assert_eq!(
            worker.dispatch(&delivery("orders", &order_payload(Some("A")))),
            DispatchOutcome::Unrouted
        );
        assert_eq!(
            worker.dispatch(&delivery("orders", &order_payload(Some("B")))),
            DispatchOutcome::Handled { handlers: 1 }
        );
        assert_eq!(*seen.lock().unwrap(), vec!["b-only"]);
    }

    #[test]
    fn test_retry_worker_routes_by_origin() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("billing", &["orders"], NO_NS, recorder("billing", &seen)).unwrap();
        registry.register("audit", &["orders"], NO_NS, recorder("audit", &seen)).unwrap();

        let worker = ConsumerWorker::escalation(
            vec!["memory".to_string()],
            Arc::new(registry),
            escalator(&broker),
            settings(),
            ShutdownSignal::new(),
        );

        let mut event = Envelope::new("shop", None, json!({"uid": 7}));
        event.retries = Some(1);
        event.original_topic = Some("orders".to_string());
        event.original_group_id = Some("billing".to_string());

        let outcome = worker.dispatch(&delivery("shop_failure_topic", &event.to_vec().unwrap()));
        assert_eq!(outcome, DispatchOutcome::Handled { handlers: 1 });
        assert_eq!(*seen.lock().unwrap(), vec!["billing"]);
    }

    #[test]
    fn test_retry_event_without_full_origin_is_dead_lettered() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("billing", &["orders"], NO_NS, recorder("billing", &seen)).unwrap();

        let worker = ConsumerWorker::escalation(
            vec!["memory".to_string()],
            Arc::new(registry),
            escalator(&broker),
            settings(),
            ShutdownSignal::new(),
        );

        let mut event = Envelope::new("shop", None, json!({"uid": 7}));
        event.retries = Some(1);
        event.original_topic = Some("orders".to_string());

        let outcome = worker.dispatch(&delivery("shop_failure_topic", &event.to_vec().unwrap()));
        assert_eq!(outcome, DispatchOutcome::Orphaned);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(broker.envelopes("shop_dead_topic"), vec![event]);
        assert!(broker.records("shop_failure_topic").is_empty());
    }

    #[test]
    fn test_exhausted_retry_goes_to_dead_letter() {
        let broker = MemoryBroker::new();
        let mut registry = ListenerRegistry::new();
        registry.register("billing", &["orders"], NO_NS, failing("charge")).unwrap();

        let worker = ConsumerWorker::escalation(
            vec!["memory".to_string()],
            Arc::new(registry),
            escalator(&broker),
            settings(),
            ShutdownSignal::new(),
        );

        let mut event = Envelope::new("shop", None, json!({"uid": 7}));
        event.retries = Some(crate::MAX_FAILURES);
        event.original_topic = Some("orders".to_string());
        event.original_group_id = Some("billing".to_string());

        let outcome = worker.dispatch(&delivery("shop_failure_topic", &event.to_vec().unwrap()));
        assert_eq!(
            outcome,
            DispatchOutcome::Escalated(Escalation::DeadLetter {
                retries: crate::MAX_FAILURES
            })
        );
        assert_eq!(broker.envelopes("shop_dead_topic"), vec![event]);
    }

    #[test]
    fn test_escalation_failure_is_contained() {
        let broker = MemoryBroker::new();
        broker.fail_produce_to("shop_failure_topic");
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], NO_NS, failing("charge")).unwrap();

        let worker = business(&broker, "g", registry);
        let outcome = worker.dispatch(&delivery("orders", &order_payload(None)));

        assert_eq!(outcome, DispatchOutcome::EscalationFailed);
    }

    #[test]
    fn test_run_commits_every_message_and_stops_on_shutdown() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], NO_NS, recorder("a", &seen)).unwrap();

        broker.append("orders", None, Some(order_payload(None)));
        broker.append("orders", None, Some(b"garbage".to_vec()));
        broker.append("orders", None, None);
        broker.append("orders", None, Some(order_payload(None)));

        let shutdown = ShutdownSignal::new();
        let worker = ConsumerWorker::business(
            "g",
            vec!["memory".to_string()],
            Arc::new(registry),
            escalator(&broker),
            settings(),
            shutdown.clone(),
        );

        let factory = broker.clone();
        let handle = thread::spawn(move || worker.run(&factory));

        assert!(broker.wait_for_commit("g", "orders", 4, Duration::from_secs(5)));
        shutdown.trigger();

        let stats = handle.join().unwrap().unwrap();
        assert_eq!(
            stats,
            WorkerStats {
                processed: 2,
                failed: 0,
                dropped: 2
            }
        );
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(broker.closed_groups(), vec!["g"]);
    }

    #[test]
    fn test_run_survives_transient_errors() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], NO_NS, recorder("a", &seen)).unwrap();

        broker.inject_poll_error("g", BrokerError::Transient("rebalancing".to_string()));
        broker.append("orders", None, Some(order_payload(None)));

        let shutdown = ShutdownSignal::new();
        let worker = ConsumerWorker::business(
            "g",
            vec!["memory".to_string()],
            Arc::new(registry),
            escalator(&broker),
            settings(),
            shutdown.clone(),
        );

        let factory = broker.clone();
        let handle = thread::spawn(move || worker.run(&factory));

        assert!(broker.wait_for_commit("g", "orders", 1, Duration::from_secs(5)));
        shutdown.trigger();

        assert_eq!(handle.join().unwrap().unwrap().processed, 1);
    }

    #[test]
    fn test_run_exits_on_fatal_error() {
        let broker = MemoryBroker::new();
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], NO_NS, failing("a")).unwrap();
        broker.inject_poll_error("g", BrokerError::Fatal("fenced".to_string()));

        let worker = business(&broker, "g", registry);
        let result = worker.run(&broker);

        assert!(matches!(result, Err(WorkerError::Fatal { .. })));
        assert_eq!(broker.closed_groups(), vec!["g"]);
    }

    #[test]
    fn test_run_reports_consumer_creation_failure() {
        let broker = MemoryBroker::new();
        broker.reject_group("g");
        let mut registry = ListenerRegistry::new();
        registry.register("g", &["orders"], NO_NS, failing("a")).unwrap();

        let worker = business(&broker, "g", registry);
        let result = worker.run(&broker);

        assert!(matches!(result, Err(WorkerError::Consumer { .. })));
        assert!(broker.closed_groups().is_empty());
    }
}
