//! Handler system for eventline.
//!
//! Handlers are the business callbacks a listener invokes for every event it
//! matches. The [`Handler`] trait is synchronous: each handler runs on its
//! consumer group's worker thread and may block.
//!
//! ## Built-in Handlers
//!
//! - [`LogHandler`]: Structured logging of events (useful for debugging)
//! - [`FnHandler`]: Adapter turning a closure into a handler
//!
//! ## Creating Custom Handlers
//!
//! ```rust,ignore
//! use eventline::{Envelope, Handler, HandlerError};
//!
//! struct ChargeCustomer;
//!
//! impl Handler for ChargeCustomer {
//!     fn name(&self) -> &str {
//!         "charge-customer"
//!     }
//!
//!     fn handle(&self, event: &Envelope) -> Result<(), HandlerError> {
//!         let order: Order = event.data_as()?;
//!         // Your logic here
//!         Ok(())
//!     }
//! }
//! ```

pub mod log;

use crate::event::Envelope;
use thiserror::Error;

pub use log::LogHandler;

/// Errors a handler can report.
///
/// Any error returned from [`Handler::handle`] sends the event down the retry
/// path; none of the variants is treated differently by the worker.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The event's `data` did not match the handler's schema
    #[error("invalid event data: {0}")]
    InvalidData(#[from] serde_json::Error),

    /// The handler panicked; the panic was caught by the worker
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Generic handler failure
    #[error("handler failed: {0}")]
    Failed(String),

    /// Failure from a downstream library
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The core handler trait.
///
/// Handlers must be `Send + Sync` because the registry is shared by every
/// worker thread.
pub trait Handler: Send + Sync {
    /// Name used in logs (e.g., "log", "charge-customer")
    fn name(&self) -> &str;

    /// Process one event. Returning an error schedules a retry.
    fn handle(&self, event: &Envelope) -> Result<(), HandlerError>;
}

/// Adapter that lets a closure act as a [`Handler`].
///
/// ```rust,ignore
/// let handler = FnHandler::new("audit", |event: &Envelope| {
///     tracing::info!(app = %event.app, "audited");
///     Ok(())
/// });
/// ```
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &Envelope) -> Result<(), HandlerError> {
        (self.func)(event)
    }
}
