//! Monitor supervisor.
//!
//! Validates the document and owns the full set of coordinators with
//! one-for-one isolation: a coordinator that crashes or exhausts its
//! retries is terminal for that monitor and invisible to its siblings.
//! Shutdown is commanded to all coordinators in parallel and bounded.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use crate::coordinator::{spawn_coordinator, CoordinatorHandle, SHUTDOWN_GRACE};
use crate::registry::SubscriberRegistry;
use crate::validator::{validate_document, MonitorRecord};
use crate::worker::WorkerRegistry;

/// Point-in-time view of one supervised monitor
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub name: String,
    pub running: bool,
}

/// Owns every monitor coordinator spawned from one document
#[derive(Debug)]
pub struct MonitorSupervisor {
    monitors: Vec<MonitorRecord>,
    coordinators: Vec<CoordinatorHandle>,
}

impl MonitorSupervisor {
    /// Validate `document` and spawn one coordinator per monitor.
    ///
    /// On validation failure returns the full aggregated reason list and
    /// starts nothing. Must be called within a tokio runtime.
    pub fn start(
        document: &Value,
        workers: &WorkerRegistry,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Result<Self, Vec<String>> {
        let monitors = validate_document(document, &workers.schema_table())?;

        let mut coordinators = Vec::with_capacity(monitors.len());
        for monitor in &monitors {
            match spawn_coordinator(monitor.clone(), workers, subscribers.clone()) {
                Ok(handle) => coordinators.push(handle),
                Err(error) => {
                    // Validation admits only installed tags, so this is an
                    // internal invariant violation. Roll the group back.
                    for handle in &coordinators {
                        handle.request_shutdown();
                    }
                    return Err(vec![format!("Monitor '{}': {error}", monitor.name)]);
                }
            }
        }

        info!("Supervising {} monitor(s)", coordinators.len());
        Ok(Self { monitors, coordinators })
    }

    /// The validated monitor table this supervisor was started from
    pub fn monitors(&self) -> &[MonitorRecord] {
        &self.monitors
    }

    /// Snapshot of each monitor's coordinator state
    pub fn status(&self) -> Vec<MonitorState> {
        self.coordinators
            .iter()
            .map(|handle| MonitorState {
                name: handle.name().to_string(),
                running: handle.is_running(),
            })
            .collect()
    }

    /// Number of coordinators still alive
    pub fn running_count(&self) -> usize {
        self.coordinators.iter().filter(|handle| handle.is_running()).count()
    }

    /// Command every coordinator to shut down in parallel, waiting a
    /// bounded window for each before escalating to abort.
    pub async fn shutdown(mut self) {
        let coordinators = std::mem::take(&mut self.coordinators);
        if coordinators.is_empty() {
            return;
        }

        info!("Shutting down {} monitor(s)", coordinators.len());
        for handle in &coordinators {
            handle.request_shutdown();
        }

        let stopped = coordinators.len();
        join_all(coordinators.into_iter().map(|handle| handle.wait(SHUTDOWN_GRACE))).await;
        info!("All {stopped} monitor(s) stopped");
    }
}

impl Drop for MonitorSupervisor {
    fn drop(&mut self) {
        // Fire-and-forget: a dropped supervisor must not leave probe tasks
        // running against external endpoints.
        for handle in &self.coordinators {
            if handle.is_running() {
                warn!("Supervisor dropped with monitor {} still running", handle.name());
                handle.request_shutdown();
            }
        }
    }
}
