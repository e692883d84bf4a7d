//! Monitor coordinator.
//!
//! One coordinator per monitor: it owns the protocol worker and the retry
//! counter, fans every envelope out to the monitor's subscribers, and turns
//! retry policy decisions into worker commands. The inbox is processed
//! strictly sequentially, which preserves per-monitor envelope ordering
//! across all subscribers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::envelope::Payload;
use crate::registry::{SubscriberMessage, SubscriberRegistry};
use crate::retry::{decide, RecoveryAction};
use crate::validator::MonitorRecord;
use crate::worker::{start_worker, WorkerHandle, WorkerRegistry};

/// Bound on waiting for a worker or coordinator to acknowledge shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(5000);

/// Handle to a running coordinator, owned by the supervisor
#[derive(Debug)]
pub struct CoordinatorHandle {
    name: String,
    shutdown: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the coordinator task is still alive
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the coordinator to shut down. Non-blocking; pair with
    /// [`CoordinatorHandle::wait`].
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait up to `grace` for the coordinator to finish, then abort it.
    pub async fn wait(self, grace: Duration) {
        let mut task = self.task;
        if timeout(grace, &mut task).await.is_err() {
            warn!(
                "Coordinator for monitor {} did not terminate within {}ms, aborting",
                self.name,
                grace.as_millis()
            );
            task.abort();
        }
    }
}

/// Spawn the coordinator (and its worker) for one validated monitor.
pub fn spawn_coordinator(
    monitor: MonitorRecord,
    workers: &WorkerRegistry,
    subscribers: Arc<SubscriberRegistry>,
) -> Result<CoordinatorHandle> {
    let factory = workers
        .get(&monitor.protocol)
        .ok_or_else(|| anyhow!("no worker installed for protocol '{}'", monitor.protocol))?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let worker = start_worker(factory.build(&monitor.config), &monitor.name, event_tx);

    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
    let name = monitor.name.clone();
    debug!(monitor = %name, protocol = %monitor.protocol, "Starting coordinator");
    let task = tokio::spawn(run(monitor, worker, event_rx, shutdown_rx, subscribers));

    Ok(CoordinatorHandle { name, shutdown: shutdown_tx, task })
}

async fn run(
    monitor: MonitorRecord,
    worker: WorkerHandle,
    mut events: mpsc::UnboundedReceiver<crate::envelope::Envelope>,
    mut shutdown: mpsc::UnboundedReceiver<()>,
    subscribers: Arc<SubscriberRegistry>,
) {
    let mut retry_count: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(monitor = %monitor.name, "Coordinator shutting down on request");
                worker.recover(RecoveryAction::Shutdown);
                worker.wait(SHUTDOWN_GRACE).await;
                return;
            }
            event = events.recv() => match event {
                Some(envelope) => {
                    let envelope = Arc::new(envelope);
                    match &envelope.payload {
                        Payload::Data { .. } => {
                            fan_out(
                                &subscribers,
                                &monitor.inform_to,
                                SubscriberMessage::MonitorData(envelope.clone()),
                            );
                            retry_count = 0;
                        }
                        Payload::Error { error } => {
                            warn!(
                                "Monitor {} probe failed: {} ({})",
                                monitor.name, error.message, error.kind
                            );
                            // Subscribers always see the envelope; the retry
                            // decision never gates delivery.
                            fan_out(
                                &subscribers,
                                &monitor.inform_to,
                                SubscriberMessage::MonitorError(envelope.clone()),
                            );

                            match decide(retry_count, &monitor.retry_policy) {
                                RecoveryAction::Retry { delay } => {
                                    retry_count += 1;
                                    info!(
                                        "Calculated backoff delay: {}ms for attempt {}",
                                        delay.as_millis(),
                                        retry_count
                                    );
                                    worker.recover(RecoveryAction::Retry { delay });
                                }
                                RecoveryAction::Shutdown => {
                                    error!(
                                        "Monitor {} shutting down after {} retries",
                                        monitor.name, retry_count
                                    );
                                    worker.recover(RecoveryAction::Shutdown);
                                    worker.wait(SHUTDOWN_GRACE).await;
                                    return;
                                }
                            }
                        }
                    }
                }
                None => {
                    warn!("Monitor {} worker terminated unexpectedly", monitor.name);
                    return;
                }
            }
        }
    }
}

fn fan_out(subscribers: &SubscriberRegistry, inform_to: &[String], message: SubscriberMessage) {
    for name in inform_to {
        subscribers.dispatch(name, &message);
    }
}
