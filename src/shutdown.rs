//! Graceful shutdown coordination for eventline.
//!
//! This module provides a [`ShutdownSignal`] that every worker thread holds a
//! clone of. Workers check it once per poll iteration; OS termination signals
//! (SIGTERM, SIGINT) trip it through [`ShutdownSignal::listen`].
//!
//! # Example
//!
//! ```rust,ignore
//! use eventline::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let listener = shutdown.listen()?;
//!
//! let worker_shutdown = shutdown.clone();
//! std::thread::spawn(move || {
//!     while !worker_shutdown.is_shutdown() {
//!         // ... poll and process events
//!     }
//! });
//! ```

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// A signal for coordinating graceful shutdown across worker threads.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown triggered");
        }
        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Wait for a termination signal (SIGTERM or SIGINT), then trigger
    /// shutdown.
    ///
    /// Returns early, without a signal, if shutdown is triggered some other
    /// way.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }

        self.trigger();
    }

    /// Install signal handlers on a dedicated thread.
    ///
    /// The thread exits once shutdown is triggered, by a signal or otherwise.
    pub fn listen(&self) -> io::Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let signal = self.clone();

        thread::Builder::new()
            .name("eventline-signals".to_string())
            .spawn(move || runtime.block_on(signal.wait_for_signal()))
    }

    /// Sleep for `duration`, waking early on shutdown.
    ///
    /// Returns `true` if the sleep was cut short by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;

        loop {
            if self.is_shutdown() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());

        signal.trigger();
        assert!(signal.is_shutdown());

        // Triggering twice is harmless.
        signal.trigger();
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_clone_receives_signal() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();

        signal2.trigger();
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_sleep_completes_without_shutdown() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();

        assert!(!signal.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_interrupted_by_shutdown() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });

        let start = Instant::now();
        assert!(signal.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_listener_thread_exits_on_trigger() {
        let signal = ShutdownSignal::new();
        let listener = signal.listen().unwrap();

        signal.trigger();
        listener.join().unwrap();
    }

    #[tokio::test]
    async fn test_triggered_resolves() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), signal.triggered()).await;
        assert!(result.is_ok());
    }
}
