//! End-to-end supervision tests against scripted stub workers.
//!
//! The stub factory plugs into the worker registry exactly like a real
//! transport, which exercises the coordinator/supervisor machinery without
//! touching the network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use argos::envelope::{Envelope, ErrorKind, ProbeError};
use argos::retry::RecoveryAction;
use argos::schema::{FieldSchema, ProtocolConfig};
use argos::worker::{ProtocolWorker, WorkerContext, WorkerFactory, WorkerRegistry};
use argos::{MonitorSupervisor, SubscriberMessage, SubscriberRegistry};

/// One scripted probe outcome
#[derive(Clone)]
enum Step {
    Ok(u64),
    Fail,
}

struct ScriptedFactory {
    script: Arc<Vec<Step>>,
    /// Park after the script instead of letting the worker task end
    park_when_done: bool,
}

impl ScriptedFactory {
    fn new(script: Vec<Step>) -> Self {
        Self { script: Arc::new(script), park_when_done: true }
    }

    fn ending(script: Vec<Step>) -> Self {
        Self { script: Arc::new(script), park_when_done: false }
    }
}

impl WorkerFactory for ScriptedFactory {
    fn tag(&self) -> &'static str {
        "scripted"
    }

    fn schema(&self) -> Vec<FieldSchema> {
        Vec::new()
    }

    fn build(&self, _config: &ProtocolConfig) -> Box<dyn ProtocolWorker> {
        Box::new(ScriptedWorker {
            script: self.script.clone(),
            park_when_done: self.park_when_done,
        })
    }
}

struct ScriptedWorker {
    script: Arc<Vec<Step>>,
    park_when_done: bool,
}

#[async_trait]
impl ProtocolWorker for ScriptedWorker {
    async fn run(self: Box<Self>, mut ctx: WorkerContext) {
        let mut last_success = None;

        for step in self.script.iter() {
            match step {
                Step::Ok(sequence) => {
                    let mut data = Map::new();
                    data.insert("sequence".to_string(), Value::from(*sequence));
                    let envelope = Envelope::data(ctx.monitor_id.clone(), data);
                    last_success = envelope.meta.last_success;
                    if !ctx.emit(envelope) {
                        return;
                    }
                    // A shutdown command may arrive between successes
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    if let Ok(RecoveryAction::Shutdown) = ctx.commands.try_recv() {
                        return;
                    }
                }
                Step::Fail => {
                    let error = ProbeError::new(ErrorKind::Network, "scripted failure");
                    if !ctx.emit(Envelope::error(ctx.monitor_id.clone(), error, last_success)) {
                        return;
                    }
                    match ctx.await_recovery().await {
                        Some(RecoveryAction::Retry { delay }) => tokio::time::sleep(delay).await,
                        Some(RecoveryAction::Shutdown) | None => return,
                    }
                }
            }
        }

        if self.park_when_done {
            loop {
                match ctx.await_recovery().await {
                    Some(RecoveryAction::Retry { .. }) => {}
                    Some(RecoveryAction::Shutdown) | None => return,
                }
            }
        }
    }
}

fn scripted_document(max_retries: Value, backoff: &str) -> Value {
    json!({
        "monitors": {
            "single": [{
                "name": "m1",
                "type": "scripted",
                "config": {},
                "retry_policy": {
                    "max_retries": max_retries,
                    "retry_timeout": 5,
                    "backoff_strategy": backoff
                }
            }]
        },
        "rules": [{"name": "r1", "monitor": "m1"}]
    })
}

fn registry_with(factory: ScriptedFactory) -> WorkerRegistry {
    let mut workers = WorkerRegistry::new();
    workers.register(Arc::new(factory));
    workers
}

async fn recv(
    inbox: &mut argos::registry::SubscriberReceiver,
) -> Option<SubscriberMessage> {
    timeout(Duration::from_secs(1), inbox.recv()).await.ok().flatten()
}

/// Poll until every coordinator has terminated
async fn wait_until_stopped(supervisor: &MonitorSupervisor) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while supervisor.running_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "coordinators still running after 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_zero_max_retries_shuts_down_after_one_error() {
    logger::try_init();

    let workers = registry_with(ScriptedFactory::new(vec![Step::Fail; 5]));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let mut inbox = subscribers.subscribe("r1");

    let document = scripted_document(json!(0), "linear");
    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();

    let message = recv(&mut inbox).await.expect("first error envelope");
    assert!(matches!(message, SubscriberMessage::MonitorError(_)));

    wait_until_stopped(&supervisor).await;

    // Exactly one envelope: the monitor died on the first failure
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(inbox.try_recv().is_err(), "no further envelopes after shutdown");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_bounded_retries_deliver_every_error_envelope() {
    logger::try_init();

    // max_retries = 3: four failures total, then the coordinator stops
    let workers = registry_with(ScriptedFactory::new(vec![Step::Fail; 10]));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let mut inbox = subscribers.subscribe("r1");

    let document = scripted_document(json!(3), "fixed");
    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();

    for attempt in 1..=4 {
        let message = recv(&mut inbox).await.unwrap_or_else(|| panic!("envelope {attempt}"));
        assert!(matches!(message, SubscriberMessage::MonitorError(_)));
    }

    wait_until_stopped(&supervisor).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(inbox.try_recv().is_err(), "exactly 4 error envelopes, 0 data envelopes");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_success_resets_retry_count() {
    logger::try_init();

    // With max_retries = 1, each success must reset the failure count;
    // only the uninterrupted double failure is fatal.
    let script = vec![Step::Fail, Step::Ok(1), Step::Fail, Step::Ok(2), Step::Fail, Step::Fail];
    let workers = registry_with(ScriptedFactory::new(script));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let mut inbox = subscribers.subscribe("r1");

    let document = scripted_document(json!(1), "fixed");
    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();

    let mut received = Vec::new();
    for _ in 0..6 {
        match recv(&mut inbox).await.expect("envelope") {
            SubscriberMessage::MonitorData(_) => received.push("data"),
            SubscriberMessage::MonitorError(_) => received.push("error"),
        }
    }
    assert_eq!(received, vec!["error", "data", "error", "data", "error", "error"]);

    wait_until_stopped(&supervisor).await;
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_preserves_per_subscriber_order() {
    logger::try_init();

    let script = vec![Step::Ok(1), Step::Ok(2), Step::Ok(3)];
    let workers = registry_with(ScriptedFactory::new(script));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let mut inbox_a = subscribers.subscribe("r1");
    let mut inbox_b = subscribers.subscribe("r1");

    let document = scripted_document(json!(3), "exponential");
    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();

    for inbox in [&mut inbox_a, &mut inbox_b] {
        for expected in 1..=3u64 {
            let message = recv(inbox).await.expect("data envelope");
            let SubscriberMessage::MonitorData(envelope) = message else {
                panic!("expected data envelope");
            };
            let argos::Payload::Data { data } = &envelope.payload else {
                panic!("data arm expected");
            };
            assert_eq!(data["sequence"], Value::from(expected));
        }
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_late_subscriber_sees_an_ordered_subsequence() {
    logger::try_init();

    let script: Vec<Step> = (1..=20).map(Step::Ok).collect();
    let workers = registry_with(ScriptedFactory::new(script));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let mut early = subscribers.subscribe("r1");

    let document = scripted_document(json!(3), "fixed");
    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();

    // Let a few envelopes pass before the second subscriber attaches
    for _ in 0..3 {
        recv(&mut early).await.expect("early envelope");
    }
    let mut late = subscribers.subscribe("r1");

    let mut sequences = Vec::new();
    while let Some(message) = recv(&mut late).await {
        let SubscriberMessage::MonitorData(envelope) = message else {
            panic!("expected data envelope")
        };
        let argos::Payload::Data { data } = &envelope.payload else { panic!("data arm") };
        sequences.push(data["sequence"].as_u64().unwrap());
        if sequences.last() == Some(&20) {
            break;
        }
    }

    // Whatever the late subscriber saw is ordered and gap-free from its
    // first observation: a subsequence of the emission order
    assert!(!sequences.is_empty());
    for pair in sequences.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_worker_death_is_terminal_for_the_monitor() {
    logger::try_init();

    // Worker task ends after one success; the coordinator must observe the
    // closed channel and terminate rather than hang.
    let workers = registry_with(ScriptedFactory::ending(vec![Step::Ok(1)]));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let mut inbox = subscribers.subscribe("r1");

    let document = scripted_document(json!(3), "fixed");
    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();

    assert!(matches!(recv(&mut inbox).await, Some(SubscriberMessage::MonitorData(_))));
    wait_until_stopped(&supervisor).await;

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_parallel_shutdown_stops_all_monitors() {
    logger::try_init();

    let workers = registry_with(ScriptedFactory::new(vec![Step::Ok(1); 1000]));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let _inbox = subscribers.subscribe("r1");
    let _inbox_2 = subscribers.subscribe("r2");

    let document = json!({
        "monitors": {
            "single": [
                {
                    "name": "m1",
                    "type": "scripted",
                    "config": {},
                    "retry_policy": {"max_retries": 3, "retry_timeout": 5, "backoff_strategy": "fixed"}
                },
                {
                    "name": "m2",
                    "type": "scripted",
                    "config": {},
                    "retry_policy": {"max_retries": 3, "retry_timeout": 5, "backoff_strategy": "fixed"}
                }
            ]
        },
        "rules": [
            {"name": "r1", "monitor": ["m1", "m2"]},
            {"name": "r2", "monitor": "m2"}
        ]
    });

    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();
    assert_eq!(supervisor.running_count(), 2);
    assert_eq!(supervisor.status().len(), 2);

    let stopped = timeout(Duration::from_secs(6), supervisor.shutdown()).await;
    assert!(stopped.is_ok(), "shutdown must complete within the bounded window");
}

#[tokio::test]
async fn test_monitor_records_expose_fan_out_targets() {
    logger::try_init();

    let workers = registry_with(ScriptedFactory::new(vec![Step::Ok(1)]));
    let subscribers = Arc::new(SubscriberRegistry::new());
    let document = json!({
        "monitors": {
            "single": [{
                "name": "m1",
                "type": "scripted",
                "config": {},
                "retry_policy": {"max_retries": 0, "retry_timeout": 5, "backoff_strategy": "fixed"}
            }]
        },
        "rules": [
            {"name": "r_first", "monitor": "m1"},
            {"name": "r_second", "monitor": ["m1"]}
        ]
    });

    let supervisor = MonitorSupervisor::start(&document, &workers, subscribers.clone()).unwrap();
    assert_eq!(supervisor.monitors()[0].inform_to, vec!["r_first", "r_second"]);
    supervisor.shutdown().await;
}
