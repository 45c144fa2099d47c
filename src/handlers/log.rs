//! Log Handler - Structured logging of events.
//!
//! The [`LogHandler`] logs every event it receives using the `tracing` crate.
//! It is what `[[listeners]]` entries with `handler = "log"` or
//! `handler = "log:<prefix>"` resolve to.

use super::{Handler, HandlerError};
use crate::event::Envelope;
use tracing::info;

/// A handler that logs events using structured logging.
#[derive(Debug, Clone)]
pub struct LogHandler {
    /// Prefix for log messages
    prefix: String,
}

impl LogHandler {
    /// Create a new LogHandler with default settings
    pub fn new() -> Self {
        Self {
            prefix: "event".to_string(),
        }
    }

    /// Create a LogHandler with a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&self, event: &Envelope) -> Result<(), HandlerError> {
        info!(
            prefix = %self.prefix,
            app = %event.app,
            namespace = ?event.namespace,
            retries = event.retry_count(),
            data = %event.data,
            "[{}] Processed event from {}",
            self.prefix,
            event.app
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_handler() {
        let handler = LogHandler::new();
        let event = Envelope::new("shop", Some("ns1".to_string()), json!({"uid": 7}));

        assert!(handler.handle(&event).is_ok());
        assert_eq!(handler.name(), "log");
        assert_eq!(handler.prefix(), "event");
    }

    #[test]
    fn test_log_handler_with_prefix() {
        let handler = LogHandler::with_prefix("audit");
        assert_eq!(handler.prefix(), "audit");
    }
}
