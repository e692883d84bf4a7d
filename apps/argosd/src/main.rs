mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use argos::{MonitorSupervisor, SubscriberMessage, SubscriberRegistry, WorkerRegistry};
use error::DocumentError;

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();

    let args: Vec<String> = env::args().collect();
    match (args.get(1).map(String::as_str), args.get(2)) {
        (Some("start"), Some(path)) => start(Path::new(path)).await,
        (Some("check"), Some(path)) => check(Path::new(path)),
        (Some(verb @ ("reload" | "stop")), _) => {
            bail!("'{verb}' needs a control channel this runtime does not carry; restart with 'argosd start <config.json>'")
        }
        _ => {
            eprintln!("Usage: argosd <start|check> <config.json>");
            std::process::exit(2);
        }
    }
}

fn load_document(path: &Path) -> Result<Value, DocumentError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| DocumentError::Read { path: PathBuf::from(path), source })?;
    Ok(serde_json::from_str(&raw)?)
}

async fn start(path: &Path) -> Result<()> {
    let document = load_document(path)?;
    let workers = WorkerRegistry::builtin();
    let subscribers = Arc::new(SubscriberRegistry::new());

    let supervisor = match MonitorSupervisor::start(&document, &workers, subscribers.clone()) {
        Ok(supervisor) => supervisor,
        Err(reasons) => {
            for reason in &reasons {
                error!("{reason}");
            }
            bail!("invalid monitor document: {} problem(s)", reasons.len());
        }
    };

    attach_log_subscribers(&supervisor, &subscribers);

    info!("argosd {} running, press Ctrl-C to stop", argos::VERSION);
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    supervisor.shutdown().await;
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let document = load_document(path)?;
    let workers = WorkerRegistry::builtin();

    match argos::validate_document(&document, &workers.schema_table()) {
        Ok(monitors) => {
            println!("{} valid monitor(s)", monitors.len());
            for monitor in &monitors {
                println!(
                    "  {} [{}] -> {}",
                    monitor.name,
                    monitor.protocol,
                    monitor.inform_to.join(", ")
                );
            }
            Ok(())
        }
        Err(reasons) => {
            for reason in &reasons {
                eprintln!("{reason}");
            }
            std::process::exit(1);
        }
    }
}

/// Attach one logging inbox per rule name so the envelope stream stays
/// visible even without a rule engine connected downstream.
fn attach_log_subscribers(supervisor: &MonitorSupervisor, subscribers: &SubscriberRegistry) {
    let mut rule_names: Vec<String> =
        supervisor.monitors().iter().flat_map(|monitor| monitor.inform_to.clone()).collect();
    rule_names.sort();
    rule_names.dedup();

    for name in rule_names {
        let mut inbox = subscribers.subscribe(&name);
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                match message {
                    SubscriberMessage::MonitorData(envelope) => {
                        info!(rule = %name, monitor = %envelope.monitor_id, "Envelope received");
                    }
                    SubscriberMessage::MonitorError(envelope) => {
                        warn!(rule = %name, monitor = %envelope.monitor_id, "Error envelope received");
                    }
                }
            }
        });
    }
}
