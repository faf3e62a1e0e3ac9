//! Background processing.
//!
//! Each [`Processor`] runs in its own loop: one iteration, then an idle wait
//! that ends early on shutdown. An iteration that errors or panics is logged
//! and the loop carries on; only shutdown ends it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::consumer::panic_message;
use crate::storage;

mod collector;
mod retry;

pub use collector::CollectorProcessor;
pub use retry::RetryProcessor;

/// Wakes the retry loop ahead of its interval.
///
/// A pulse sent while the loop is busy is remembered, so the next idle wait
/// returns immediately.
#[derive(Debug, Clone, Default)]
pub struct Pulse(Arc<Notify>);

impl Pulse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pulse(&self) {
        self.0.notify_one();
    }

    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

/// A background loop body.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// One iteration.
    async fn process(&self) -> storage::Result<()>;

    /// Wait before the next iteration.
    async fn idle(&self);
}

/// Run `processor` until `shutdown` flips to `true`.
pub async fn run_processor(processor: Arc<dyn Processor>, mut shutdown: watch::Receiver<bool>) {
    let name = processor.name();
    info!(processor = name, "Processor started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match AssertUnwindSafe(processor.process()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(processor = name, error = %e, "Processor iteration failed"),
            Err(panic) => error!(
                processor = name,
                panic = %panic_message(panic.as_ref()),
                "Processor iteration panicked"
            ),
        }

        tokio::select! {
            _ = processor.idle() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(processor = name, "Processor stopped");
}

/// Owns the background tasks and stops them together.
pub struct ProcessingServer {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl ProcessingServer {
    /// `timeout` bounds how long [`ProcessingServer::shutdown`] waits.
    pub fn new(timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
            timeout,
        }
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawn a processor loop.
    pub fn spawn(&mut self, processor: Arc<dyn Processor>) {
        let shutdown = self.shutdown_signal();
        self.handles
            .push(tokio::spawn(run_processor(processor, shutdown)));
    }

    /// Take ownership of tasks started elsewhere so shutdown waits for them.
    pub fn track(&mut self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.handles.extend(handles);
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal shutdown and wait for every task, up to the timeout. Tasks
    /// still running after that are aborted. Returns `true` on a clean stop.
    pub async fn shutdown(self) -> bool {
        self.shutdown.send_replace(true);

        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(self.timeout, futures::future::join_all(self.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Background task ended abnormally");
                    }
                }
                info!("Processing server stopped");
                true
            }
            Err(_) => {
                warn!(
                    timeout_ms = %self.timeout.as_millis(),
                    "Shutdown timed out, aborting remaining tasks"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}
