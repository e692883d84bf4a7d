//! Protocol workers.
//!
//! A worker owns the transport connection for one monitor and emits
//! normalized envelopes to its coordinator. After emitting an error it
//! suspends itself and waits for a recovery command; it never reschedules
//! autonomously. New transports plug in through [`WorkerFactory`] and are
//! discovered via [`WorkerRegistry::builtin`] at startup.

pub mod http;
pub mod mqtt;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::retry::RecoveryAction;
use crate::schema::{FieldSchema, ProtocolConfig, SchemaTable};

pub use http::HttpWorkerFactory;
pub use mqtt::MqttWorkerFactory;
pub use websocket::WebSocketWorkerFactory;

/// Everything a running worker needs: who it is, where envelopes go, and
/// where recovery commands arrive.
pub struct WorkerContext {
    pub monitor_id: String,
    pub events: mpsc::UnboundedSender<Envelope>,
    pub commands: mpsc::UnboundedReceiver<RecoveryAction>,
}

impl WorkerContext {
    /// Emit an envelope to the owning coordinator. Returns false when the
    /// coordinator is gone and the worker should wind down.
    pub fn emit(&self, envelope: Envelope) -> bool {
        self.events.send(envelope).is_ok()
    }

    /// Block until the coordinator sends a recovery command.
    ///
    /// Called after emitting an error envelope. `None` means the command
    /// channel closed, which the worker treats as shutdown.
    pub async fn await_recovery(&mut self) -> Option<RecoveryAction> {
        self.commands.recv().await
    }
}

/// The task body of one protocol worker
#[async_trait]
pub trait ProtocolWorker: Send {
    async fn run(self: Box<Self>, ctx: WorkerContext);
}

/// Outcome of the suspend-then-recover step shared by push-based workers
pub(crate) enum Recovered {
    /// The coordinator granted a retry; the backoff delay already elapsed
    Reconnect,
    /// Shutdown was commanded or the coordinator is gone
    Stop,
}

/// Emit an error envelope, then suspend until the coordinator decides.
pub(crate) async fn emit_and_await_recovery(
    ctx: &mut WorkerContext,
    error: crate::envelope::ProbeError,
    last_success: Option<std::time::SystemTime>,
) -> Recovered {
    if !ctx.emit(Envelope::error(ctx.monitor_id.clone(), error, last_success)) {
        return Recovered::Stop;
    }
    match ctx.await_recovery().await {
        Some(RecoveryAction::Retry { delay }) => {
            tokio::time::sleep(delay).await;
            Recovered::Reconnect
        }
        Some(RecoveryAction::Shutdown) | None => Recovered::Stop,
    }
}

/// Constructs workers for one protocol tag and advertises its schema
pub trait WorkerFactory: Send + Sync {
    /// Stable protocol tag referenced by the document's `type` field
    fn tag(&self) -> &'static str;

    /// Field schemas for this protocol's `config` map
    fn schema(&self) -> Vec<FieldSchema>;

    /// Build a worker from an already-validated configuration
    fn build(&self, config: &ProtocolConfig) -> Box<dyn ProtocolWorker>;
}

/// Handle to a spawned worker task, owned by its coordinator
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<RecoveryAction>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Send a recovery command. Returns false when the worker is gone.
    pub fn recover(&self, action: RecoveryAction) -> bool {
        self.commands.send(action).is_ok()
    }

    /// Wait up to `grace` for the worker task to finish, then abort it.
    pub async fn wait(self, grace: Duration) {
        let mut task = self.task;
        if timeout(grace, &mut task).await.is_err() {
            warn!("Worker did not terminate within {}ms, aborting", grace.as_millis());
            task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn `worker` as an independent task emitting to `events`.
pub fn start_worker(
    worker: Box<dyn ProtocolWorker>,
    monitor_id: &str,
    events: mpsc::UnboundedSender<Envelope>,
) -> WorkerHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let ctx = WorkerContext { monitor_id: monitor_id.to_string(), events, commands: command_rx };

    debug!(monitor = monitor_id, "Spawning protocol worker");
    let task = tokio::spawn(worker.run(ctx));

    WorkerHandle { commands: command_tx, task }
}

/// Index of installed protocol workers, keyed by tag.
///
/// Built once at startup; the schema table handed to the validator is
/// derived from it, so adding a transport never touches the core.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<&'static str, Arc<dyn WorkerFactory>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in transports
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpWorkerFactory));
        registry.register(Arc::new(MqttWorkerFactory));
        registry.register(Arc::new(WebSocketWorkerFactory));
        registry
    }

    /// Install a factory. A later factory with the same tag wins.
    pub fn register(&mut self, factory: Arc<dyn WorkerFactory>) {
        self.factories.insert(factory.tag(), factory);
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn WorkerFactory>> {
        self.factories.get(tag)
    }

    /// Protocol tag to field-schema table for the validator
    pub fn schema_table(&self) -> SchemaTable {
        self.factories
            .iter()
            .map(|(tag, factory)| (tag.to_string(), factory.schema()))
            .collect()
    }
}
