//! Orchestrator.
//!
//! Starts one [`ConsumerWorker`] thread per registered consumer group plus the
//! retry worker, then blocks until every one of them has returned. A worker
//! that dies (consumer creation, fatal broker error, panic) is reported; the
//! others keep running until shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(registry, publisher, Arc::new(factory), brokers)
//!     .with_settings(config.worker.settings());
//!
//! let report = orchestrator.start()?;
//! ```

use crate::broker::ConsumerFactory;
use crate::escalation::Escalator;
use crate::publisher::Publisher;
use crate::registry::ListenerRegistry;
use crate::shutdown::ShutdownSignal;
use crate::worker::{panic_message, ConsumerWorker, WorkerError, WorkerSettings, WorkerStats};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors that prevent the orchestrator from running.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("'{0}' is reserved for retry and dead-letter traffic")]
    ReservedName(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),
}

/// How a worker thread ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// Returned after shutdown
    Stopped(WorkerStats),

    /// Returned early on a consumer error
    Failed(WorkerError),

    /// The thread panicked outside handler code
    Panicked(String),
}

#[derive(Debug)]
pub struct WorkerReport {
    pub group_id: String,
    pub exit: WorkerExit,
}

/// Outcome of every worker, in start order. The retry worker comes last.
#[derive(Debug, Default)]
pub struct OrchestratorReport {
    pub workers: Vec<WorkerReport>,
}

impl OrchestratorReport {
    /// Whether any worker stopped for a reason other than shutdown.
    pub fn has_failures(&self) -> bool {
        self.workers
            .iter()
            .any(|w| !matches!(w.exit, WorkerExit::Stopped(_)))
    }

    pub fn worker(&self, group_id: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.group_id == group_id)
    }
}

/// Runs every consumer group of a registry.
pub struct Orchestrator {
    registry: Arc<ListenerRegistry>,
    publisher: Arc<Publisher>,
    factory: Arc<dyn ConsumerFactory>,
    brokers: Vec<String>,
    settings: WorkerSettings,
    flush_timeout: Duration,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// The registry is frozen from here on. `publisher` is used for
    /// escalation and flushed when every worker has stopped.
    pub fn new(
        registry: ListenerRegistry,
        publisher: Arc<Publisher>,
        factory: Arc<dyn ConsumerFactory>,
        brokers: Vec<String>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            publisher,
            factory,
            brokers,
            settings: WorkerSettings::default(),
            flush_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Run until SIGTERM or Ctrl+C.
    pub fn start(&self) -> Result<OrchestratorReport, OrchestratorError> {
        let shutdown = ShutdownSignal::new();
        let listener = shutdown.listen().map_err(OrchestratorError::Signal)?;

        let result = self.run(&shutdown);

        // Releases the signal thread when workers stopped on their own.
        shutdown.trigger();
        if listener.join().is_err() {
            warn!("Signal listener thread panicked");
        }

        result
    }

    /// Run until `shutdown` is triggered or every worker has stopped.
    pub fn run(&self, shutdown: &ShutdownSignal) -> Result<OrchestratorReport, OrchestratorError> {
        let escalator = Escalator::new(Arc::clone(&self.publisher));

        if let Some(name) = self.registry.reserved_collision(escalator.topics()) {
            return Err(OrchestratorError::ReservedName(name.to_string()));
        }

        if self.registry.is_empty() {
            warn!("No listeners registered, only the retry worker will run");
        }

        let mut workers: Vec<ConsumerWorker> = self
            .registry
            .groups()
            .into_iter()
            .map(|group| {
                ConsumerWorker::business(
                    group,
                    self.brokers.clone(),
                    Arc::clone(&self.registry),
                    escalator.clone(),
                    self.settings,
                    shutdown.clone(),
                )
            })
            .collect();

        workers.push(ConsumerWorker::escalation(
            self.brokers.clone(),
            Arc::clone(&self.registry),
            escalator,
            self.settings,
            shutdown.clone(),
        ));

        info!(
            workers = workers.len(),
            groups = ?self.registry.groups(),
            "Starting workers"
        );

        let mut handles: Vec<(String, JoinHandle<Result<WorkerStats, WorkerError>>)> =
            Vec::with_capacity(workers.len());

        for worker in workers {
            let group_id = worker.group_id().to_string();
            let factory = Arc::clone(&self.factory);

            let spawned = thread::Builder::new()
                .name(format!("eventline-{}", group_id))
                .spawn(move || worker.run(factory.as_ref()));

            match spawned {
                Ok(handle) => handles.push((group_id, handle)),
                Err(e) => {
                    error!(group_id = %group_id, error = %e, "Failed to spawn worker thread");
                    shutdown.trigger();
                    join_all(handles);
                    return Err(OrchestratorError::Spawn(e));
                }
            }
        }

        let report = join_all(handles);

        self.publisher.close(self.flush_timeout);

        if report.has_failures() {
            warn!("Orchestrator stopped with failed workers");
        } else {
            info!("All workers stopped");
        }

        Ok(report)
    }
}

fn join_all(
    handles: Vec<(String, JoinHandle<Result<WorkerStats, WorkerError>>)>,
) -> OrchestratorReport {
    let workers = handles
        .into_iter()
        .map(|(group_id, handle)| {
            let exit = match handle.join() {
                Ok(Ok(stats)) => WorkerExit::Stopped(stats),
                Ok(Err(e)) => WorkerExit::Failed(e),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(group_id = %group_id, panic = %message, "Worker thread panicked");
                    WorkerExit::Panicked(message)
                }
            };
            WorkerReport { group_id, exit }
        })
        .collect();

    OrchestratorReport { workers }
}
