//! In-process broker.
//!
//! [`MemoryBroker`] keeps one append-only log per topic and one committed
//! offset per `(group, topic)`, which is enough to run the whole pipeline
//! (publisher, business workers, retry worker) inside a single process. It
//! implements both [`EventSink`] and [`ConsumerFactory`].
//!
//! Topics have a single partition (`0`). Consumers resume from the group's
//! committed offset, or from the start of the log when nothing has been
//! committed yet.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventline::broker::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! broker.append("orders", None, Some(b"not json".to_vec()));
//!
//! // ... run workers with `broker.clone()` as sink and factory ...
//!
//! assert!(broker.wait_for_commit("billing", "orders", 1, Duration::from_secs(5)));
//! ```

use super::{BrokerError, ConsumerFactory, Delivery, EventConsumer, EventSink, WorkerConfig};
use crate::event::Envelope;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// A record stored in a topic log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<Record>>,
    committed: HashMap<(String, String), i64>,
    failing_topics: HashSet<String>,
    rejected_groups: HashSet<String>,
    poll_errors: HashMap<String, VecDeque<BrokerError>>,
    closed_groups: Vec<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to an in-process broker. Clones see the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw record and return its offset.
    pub fn append(&self, topic: &str, key: Option<&str>, payload: Option<Vec<u8>>) -> i64 {
        let mut state = self.shared.lock();
        let log = state.logs.entry(topic.to_string()).or_default();
        log.push(Record {
            key: key.map(str::to_string),
            payload,
        });
        let offset = log.len() as i64 - 1;
        drop(state);

        self.shared.changed.notify_all();
        offset
    }

    /// Every record ever appended to `topic`.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.shared
            .lock()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// The decodable envelopes on `topic`, in log order.
    pub fn envelopes(&self, topic: &str) -> Vec<Envelope> {
        self.records(topic)
            .iter()
            .filter_map(|record| record.payload.as_deref())
            .filter_map(|payload| Envelope::from_slice(payload).ok())
            .collect()
    }

    /// Next offset the group will read from `topic`, if it ever committed.
    pub fn committed(&self, group_id: &str, topic: &str) -> Option<i64> {
        self.shared
            .lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
    }

    /// Wait until `group_id` has committed at least `offset` on `topic`.
    pub fn wait_for_commit(&self, group_id: &str, topic: &str, offset: i64, timeout: Duration) -> bool {
        let key = (group_id.to_string(), topic.to_string());
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        loop {
            if state.committed.get(&key).is_some_and(|c| *c >= offset) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Make every produce to `topic` fail.
    pub fn fail_produce_to(&self, topic: &str) {
        self.shared.lock().failing_topics.insert(topic.to_string());
    }

    /// Make consumer creation for `group_id` fail.
    pub fn reject_group(&self, group_id: &str) {
        self.shared.lock().rejected_groups.insert(group_id.to_string());
    }

    /// Queue an error to be returned by the next poll of `group_id`.
    pub fn inject_poll_error(&self, group_id: &str, error: BrokerError) {
        self.shared
            .lock()
            .poll_errors
            .entry(group_id.to_string())
            .or_default()
            .push_back(error);
        self.shared.changed.notify_all();
    }

    /// Groups whose consumers have been closed, in closing order.
    pub fn closed_groups(&self) -> Vec<String> {
        self.shared.lock().closed_groups.clone()
    }
}

impl EventSink for MemoryBroker {
    fn produce(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), BrokerError> {
        if self.shared.lock().failing_topics.contains(topic) {
            return Err(BrokerError::Enqueue {
                topic: topic.to_string(),
                reason: "topic unavailable".to_string(),
            });
        }

        let offset = self.append(topic, key, Some(payload.to_vec()));
        debug!(topic = %topic, offset = offset, "Produced event");
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

impl ConsumerFactory for MemoryBroker {
    fn create(&self, config: &WorkerConfig) -> Result<Box<dyn EventConsumer>, BrokerError> {
        if self.shared.lock().rejected_groups.contains(&config.group_id) {
            return Err(BrokerError::Client(format!(
                "group '{}' rejected by broker",
                config.group_id
            )));
        }

        let mut topics = config.topics.clone();
        topics.sort();
        topics.dedup();

        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            group_id: config.group_id.clone(),
            topics,
            positions: HashMap::new(),
        }))
    }
}

/// Consumer side of [`MemoryBroker`].
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    topics: Vec<String>,
    positions: HashMap<String, i64>,
}

impl MemoryConsumer {
    fn next_delivery(&mut self, state: &State) -> Option<Delivery> {
        for topic in &self.topics {
            let position = *self.positions.entry(topic.clone()).or_insert_with(|| {
                state
                    .committed
                    .get(&(self.group_id.clone(), topic.clone()))
                    .copied()
                    .unwrap_or(0)
            });

            let Some(record) = state
                .logs
                .get(topic)
                .and_then(|log| log.get(position as usize))
            else {
                continue;
            };

            self.positions.insert(topic.clone(), position + 1);
            return Some(Delivery {
                topic: topic.clone(),
                partition: 0,
                offset: position,
                key: record.key.clone().map(String::into_bytes),
                payload: record.payload.clone(),
            });
        }

        None
    }
}

impl EventConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();

        loop {
            if let Some(error) = state
                .poll_errors
                .get_mut(&self.group_id)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }

            if let Some(delivery) = self.next_delivery(&state) {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        let next = state
            .committed
            .entry((self.group_id.clone(), delivery.topic.clone()))
            .or_insert(0);
        *next = (*next).max(delivery.offset + 1);
        drop(state);

        self.shared.changed.notify_all();
        Ok(())
    }

    fn close(&mut self) {
        self.shared.lock().closed_groups.push(self.group_id.clone());
        self.shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(group: &str, topics: &[&str]) -> WorkerConfig {
        WorkerConfig {
            brokers: vec!["memory".to_string()],
            group_id: group.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_poll_in_order_and_resume_from_commit() {
        let broker = MemoryBroker::new();
        broker.append("orders", Some("k"), Some(b"first".to_vec()));
        broker.append("orders", None, Some(b"second".to_vec()));

        let mut consumer = broker.create(&config("g", &["orders"])).unwrap();
        let first = consumer.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.key_str(), Some("k"));
        consumer.commit(&first).unwrap();
        assert_eq!(broker.committed("g", "orders"), Some(1));

        // A new consumer in the same group starts after the committed offset.
        let mut replacement = broker.create(&config("g", &["orders"])).unwrap();
        let next = replacement.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(next.payload.as_deref(), Some(&b"second"[..]));

        // Other groups start from the beginning.
        let mut other = broker.create(&config("other", &["orders"])).unwrap();
        assert_eq!(other.poll(Duration::from_millis(10)).unwrap().unwrap().offset, 0);
    }

    #[test]
    fn test_empty_poll_times_out() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.create(&config("g", &["orders"])).unwrap();

        let start = Instant::now();
        assert!(consumer.poll(Duration::from_millis(20)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_poll_wakes_on_produce() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.create(&config("g", &["orders"])).unwrap();

        let producer = broker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.produce("orders", None, b"{}").unwrap();
        });

        let delivery = consumer.poll(Duration::from_secs(5)).unwrap();
        assert!(delivery.is_some());
        handle.join().unwrap();
    }

    #[test]
    fn test_failure_injection() {
        let broker = MemoryBroker::new();

        broker.fail_produce_to("dead");
        assert!(matches!(
            broker.produce("dead", None, b"{}"),
            Err(BrokerError::Enqueue { .. })
        ));
        assert!(broker.records("dead").is_empty());

        broker.reject_group("g");
        assert!(broker.create(&config("g", &["orders"])).is_err());

        let mut consumer = broker.create(&config("h", &["orders"])).unwrap();
        broker.inject_poll_error("h", BrokerError::Transient("blip".into()));
        assert_eq!(
            consumer.poll(Duration::from_millis(10)),
            Err(BrokerError::Transient("blip".into()))
        );
        assert_eq!(consumer.poll(Duration::from_millis(10)), Ok(None));
    }

    #[test]
    fn test_wait_for_commit() {
        let broker = MemoryBroker::new();
        broker.append("orders", None, Some(b"{}".to_vec()));
        assert!(!broker.wait_for_commit("g", "orders", 1, Duration::from_millis(10)));

        let mut consumer = broker.create(&config("g", &["orders"])).unwrap();
        let delivery = consumer.poll(Duration::from_millis(10)).unwrap().unwrap();
        consumer.commit(&delivery).unwrap();
        assert!(broker.wait_for_commit("g", "orders", 1, Duration::from_millis(10)));

        consumer.close();
        assert_eq!(broker.closed_groups(), vec!["g"]);
    }
}
