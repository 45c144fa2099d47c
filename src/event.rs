//! Core event types for eventline.
//!
//! The [`Envelope`] is the wire document every publisher emits and every
//! worker decodes. Once an event fails, the same envelope carries its retry
//! metadata (`retries`, `original_topic`, `original_group_id`) through the
//! retry topic and, eventually, the dead-letter topic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An event flowing through the pipeline.
///
/// Older producers write the namespace under the short key `np`. It is read
/// into `namespace` and always written back as `namespace`, so a republished
/// event from such a producer differs from its input in that one key.
///
/// # Example
///
/// ```json
/// {
///   "ts": 1765447200000,
///   "trace": null,
///   "app": "shop",
///   "namespace": "ns1",
///   "data": {"uid": 7},
///   "retries": 1,
///   "original_topic": "orders",
///   "original_group_id": "billing"
/// }
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Envelope {
    /// Publish time in milliseconds since the Unix epoch
    #[serde(default)]
    pub ts: i64,

    /// Trace identifier, if the publisher attached one
    #[serde(default)]
    pub trace: Option<String>,

    /// Name of the publishing application
    #[serde(default)]
    pub app: String,

    /// Logical sub-channel used for listener filtering
    #[serde(default, alias = "np")]
    pub namespace: Option<String>,

    /// Business payload
    #[serde(default)]
    pub data: Value,

    /// Number of failed attempts so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Topic the event was first consumed from before it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_topic: Option<String>,

    /// Consumer group whose handler first failed on this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_group_id: Option<String>,

    /// Unknown top-level fields, kept so republished events stay verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Create a fresh envelope stamped with the current time.
    pub fn new(app: impl Into<String>, namespace: Option<String>, data: Value) -> Self {
        Self {
            ts: now_ms(),
            trace: None,
            app: app.into(),
            namespace,
            data,
            retries: None,
            original_topic: None,
            original_group_id: None,
            extra: Map::new(),
        }
    }

    /// Set the trace identifier
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Decode a raw message payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize to the JSON wire format.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode `data` into a handler-owned schema.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Attempts that have already failed.
    pub fn retry_count(&self) -> u32 {
        self.retries.unwrap_or(0)
    }

    /// The `(group_id, topic)` this event was first consumed as, if it is on
    /// the retry path.
    pub fn origin(&self) -> Option<(&str, &str)> {
        match (&self.original_group_id, &self.original_topic) {
            (Some(group), Some(topic)) => Some((group.as_str(), topic.as_str())),
            _ => None,
        }
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
