//! Recurring engine loops with cooperative shutdown
//!
//! Each lifecycle engine runs as its own task. A loop ticks on a fixed
//! interval, logs and counts failed cycles without stopping, and exits when
//! the shared `ShutdownSignal` fires, including in the middle of a cycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::metrics::record_error;

/// Cancellation shared by every background task
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Final tally of a stopped engine loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineExit {
    pub name: String,
    pub cycles: u64,
    pub failures: u64,
}

/// Spawn a loop that runs `cycle` every `interval` until shutdown
///
/// The first cycle runs immediately.
pub fn spawn_engine_loop<F, Fut, R>(
    name: &str,
    interval: Duration,
    shutdown: ShutdownSignal,
    mut cycle: F,
) -> JoinHandle<EngineExit>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: fmt::Display + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let mut exit = EngineExit {
            name: name.clone(),
            cycles: 0,
            failures: 0,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(engine = %name, interval_secs = interval.as_secs(), "Engine loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!(engine = %name, "Engine cycle interrupted by shutdown");
                    break;
                }
                outcome = cycle() => {
                    exit.cycles += 1;
                    match outcome {
                        Ok(report) => debug!(engine = %name, %report, "Engine cycle complete"),
                        Err(e) => {
                            exit.failures += 1;
                            record_error(&e, &name);
                            error!(engine = %name, error = %e, "Engine cycle failed");
                        }
                    }
                }
            }
        }

        info!(
            engine = %name,
            cycles = exit.cycles,
            failures = exit.failures,
            "Engine loop stopped"
        );
        exit
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MemoryError;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_loop_counts_cycles_and_failures() {
        let shutdown = ShutdownSignal::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        let handle = spawn_engine_loop("test", Duration::from_secs(10), shutdown.clone(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 1 {
                    Err(MemoryError::Storage("backend down".into()))
                } else {
                    Ok(n)
                }
            }
        });

        // Ticks at 0s, 10s and 20s
        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.trigger();
        let exit = handle.await.unwrap();

        assert_eq!(exit.cycles, 3);
        assert_eq!(exit.failures, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_long_cycle() {
        let shutdown = ShutdownSignal::new();
        let handle = spawn_engine_loop("slow", Duration::from_secs(1), shutdown.clone(), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, MemoryError>("done")
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.trigger();
        let exit = handle.await.unwrap();

        assert_eq!(exit.cycles, 0);
        assert!(shutdown.is_triggered());
    }
}
