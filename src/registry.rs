//! Listener Registry - which handlers run for which events.
//!
//! The [`ListenerRegistry`] maps a consumer group to the listeners registered
//! under it. Each [`ListenerItem`] pairs a set of topics and an optional
//! namespace allow-list with a [`Handler`].
//!
//! # Matching
//!
//! ```text
//! Listener namespaces | Event namespace | Delivered?
//! --------------------|-----------------|-----------
//! None                | anything        | yes
//! ["A"]               | "A"             | yes
//! ["B"]               | "A"             | no
//! ["B"]               | null            | no
//! ```
//!
//! All matching listeners of a group run sequentially, in registration order.
//!
//! The registry is built once during application wiring and then shared
//! read-only (behind an `Arc`) by every worker thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventline::{ListenerRegistry, LogHandler};
//! use std::sync::Arc;
//!
//! let mut registry = ListenerRegistry::new();
//! registry.register("billing", &["orders"], Some(&["ns1"]), Arc::new(ChargeCustomer))?;
//! registry.register("audit", &["orders", "refunds"], None, Arc::new(LogHandler::new()))?;
//! ```

use crate::escalation::FailureTopics;
use crate::handlers::Handler;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors raised while registering listeners.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("group id must not be empty")]
    EmptyGroupId,

    #[error("listener for group '{0}' has no topics")]
    NoTopics(String),

    #[error("listener for group '{0}' has an empty topic name")]
    EmptyTopic(String),

    #[error("'{0}' is reserved for retry and dead-letter traffic")]
    ReservedName(String),
}

/// A handler bound to a set of topics and an optional namespace filter.
#[derive(Clone)]
pub struct ListenerItem {
    topics: BTreeSet<String>,
    namespaces: Option<BTreeSet<String>>,
    handler: Arc<dyn Handler>,
}

impl ListenerItem {
    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    pub fn namespaces(&self) -> Option<&BTreeSet<String>> {
        self.namespaces.as_ref()
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Whether this listener wants an event that arrived as `topic` with
    /// the given namespace.
    pub fn matches(&self, topic: &str, namespace: Option<&str>) -> bool {
        if !self.topics.contains(topic) {
            return false;
        }

        match &self.namespaces {
            None => true,
            Some(allowed) => namespace.is_some_and(|ns| allowed.contains(ns)),
        }
    }
}

impl fmt::Debug for ListenerItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerItem")
            .field("topics", &self.topics)
            .field("namespaces", &self.namespaces)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Consumer group → listeners, in registration order.
#[derive(Clone, Default, Debug)]
pub struct ListenerRegistry {
    groups: BTreeMap<String, Vec<ListenerItem>>,
    reserved: Option<FailureTopics>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that rejects the retry/dead-letter names of
    /// `failure` at registration time.
    pub fn with_reserved(failure: FailureTopics) -> Self {
        Self {
            groups: BTreeMap::new(),
            reserved: Some(failure),
        }
    }

    /// Register a handler for `topics` under `group_id`.
    ///
    /// `namespaces = None` (or an empty list) accepts events from every
    /// namespace.
    pub fn register<T, N>(
        &mut self,
        group_id: &str,
        topics: &[T],
        namespaces: Option<&[N]>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError>
    where
        T: AsRef<str>,
        N: AsRef<str>,
    {
        if group_id.is_empty() {
            return Err(RegistryError::EmptyGroupId);
        }
        if topics.is_empty() {
            return Err(RegistryError::NoTopics(group_id.to_string()));
        }

        let topics: BTreeSet<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();
        if topics.iter().any(|t| t.is_empty()) {
            return Err(RegistryError::EmptyTopic(group_id.to_string()));
        }

        if let Some(reserved) = &self.reserved {
            if let Some(name) = reserved.collision(group_id, topics.iter().map(String::as_str)) {
                return Err(RegistryError::ReservedName(name.to_string()));
            }
        }

        let namespaces: Option<BTreeSet<String>> = namespaces
            .map(|ns| ns.iter().map(|n| n.as_ref().to_string()).collect::<BTreeSet<_>>())
            .filter(|ns| !ns.is_empty());

        debug!(
            group_id = %group_id,
            topics = ?topics,
            namespaces = ?namespaces,
            handler = %handler.name(),
            "Registering listener"
        );

        self.groups
            .entry(group_id.to_string())
            .or_default()
            .push(ListenerItem {
                topics,
                namespaces,
                handler,
            });

        Ok(())
    }

    /// Registered consumer groups, sorted.
    pub fn groups(&self) -> Vec<&str> {
        self.groups.keys().map(|g| g.as_str()).collect()
    }

    /// Union of every topic registered under `group_id`.
    pub fn topics_for(&self, group_id: &str) -> BTreeSet<String> {
        self.listeners(group_id)
            .iter()
            .flat_map(|item| item.topics.iter().cloned())
            .collect()
    }

    /// Listeners of a group, in registration order.
    pub fn listeners(&self, group_id: &str) -> &[ListenerItem] {
        self.groups.get(group_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Listeners of `group_id` that want an event on `topic` in `namespace`.
    pub fn matching<'a>(
        &'a self,
        group_id: &str,
        topic: &'a str,
        namespace: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ListenerItem> + 'a {
        self.listeners(group_id)
            .iter()
            .filter(move |item| item.matches(topic, namespace))
    }

    /// First group or topic that collides with the retry/dead-letter names.
    pub fn reserved_collision<'a>(&'a self, failure: &FailureTopics) -> Option<&'a str> {
        self.groups.iter().find_map(|(group, items)| {
            failure.collision(
                group,
                items.iter().flat_map(|item| item.topics.iter().map(String::as_str)),
            )
        })
    }

    /// Number of registered groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
