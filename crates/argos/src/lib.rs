//! Argos - configuration-driven endpoint probe runtime.
//!
//! Argos continuously probes external endpoints over HTTP polling, MQTT
//! subscription, and WebSocket streaming, and emits a uniform envelope
//! stream for downstream rule evaluators. A single declarative document
//! describes the probes and their fan-out; the runtime validates it,
//! supervises one worker per probe, classifies failures, applies the
//! configured retry policy, and delivers every result to the subscribers
//! named in the document.

pub mod coordinator;
pub mod envelope;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod supervisor;
pub mod validator;
pub mod worker;

// Re-export the types crossing the crate's main seams
pub use envelope::{Envelope, ErrorKind, LinkStatus, Payload, ProbeError};
pub use registry::{SubscriberMessage, SubscriberRegistry};
pub use retry::{decide, BackoffStrategy, RecoveryAction, RetryPolicy};
pub use supervisor::{MonitorState, MonitorSupervisor};
pub use validator::{validate_document, MonitorRecord};
pub use worker::{ProtocolWorker, WorkerContext, WorkerFactory, WorkerRegistry};

/// Argos result type using anyhow for error handling
pub type Result<T> = anyhow::Result<T>;

/// Crate version, surfaced in user agents and startup logs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
