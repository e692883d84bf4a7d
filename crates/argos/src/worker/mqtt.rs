//! MQTT subscription worker.
//!
//! Push-based: subscribes to the configured topic and emits one success
//! envelope per inbound publish. On connection loss or protocol error it
//! emits a classified error envelope and suspends until the coordinator
//! answers with a recovery command.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tracing::debug;

use super::{emit_and_await_recovery, ProtocolWorker, Recovered, WorkerContext, WorkerFactory};
use crate::envelope::{Envelope, ErrorKind, ProbeError};
use crate::retry::RecoveryAction;
use crate::schema::{ConfigValue, FieldSchema, FieldType, ProtocolConfig};
use crate::validator::ConfigExt;

pub struct MqttWorkerFactory;

impl WorkerFactory for MqttWorkerFactory {
    fn tag(&self) -> &'static str {
        "mqtt"
    }

    fn schema(&self) -> Vec<FieldSchema> {
        vec![
            FieldSchema::required("host", FieldType::String),
            FieldSchema::optional("port", FieldType::Integer, ConfigValue::Int(1883))
                .bounds(1, 65_535),
            FieldSchema::required("topic", FieldType::String).pattern("^.+$"),
            FieldSchema::optional("client_id", FieldType::String, ConfigValue::Str(String::new())),
            FieldSchema::allowed("username", FieldType::String),
            FieldSchema::allowed("password", FieldType::String),
            FieldSchema::optional("keep_alive", FieldType::Integer, ConfigValue::Int(60))
                .bounds(5, 3600),
        ]
    }

    fn build(&self, config: &ProtocolConfig) -> Box<dyn ProtocolWorker> {
        Box::new(MqttWorker::from_config(config))
    }
}

pub(crate) struct MqttWorker {
    host: String,
    port: u16,
    topic: String,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    keep_alive: Duration,
}

impl MqttWorker {
    pub(crate) fn from_config(config: &ProtocolConfig) -> Self {
        let configured_id = config.str_field("client_id");
        let client_id = if configured_id.is_empty() {
            format!("argos-{:04x}", rand::random::<u16>())
        } else {
            configured_id
        };

        Self {
            host: config.str_field("host"),
            port: config.int_field("port").clamp(1, 65_535) as u16,
            topic: config.str_field("topic"),
            client_id,
            username: config.get("username").and_then(|v| v.as_str()).map(str::to_string),
            password: config.get("password").and_then(|v| v.as_str()).map(str::to_string),
            keep_alive: Duration::from_secs(config.int_field("keep_alive").max(5) as u64),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

fn classify_connection_error(error: &ConnectionError) -> ProbeError {
    let (kind, message) = match error {
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            (ErrorKind::Timeout, "MQTT connection timed out")
        }
        ConnectionError::Io(_) => (ErrorKind::Network, "MQTT connection lost"),
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                (ErrorKind::Authentication, "MQTT broker refused credentials")
            }
            _ => (ErrorKind::Protocol, "MQTT broker refused connection"),
        },
        ConnectionError::MqttState(_) => (ErrorKind::Protocol, "MQTT protocol error"),
        _ => (ErrorKind::Unknown, "MQTT connection failed"),
    };

    ProbeError::new(kind, message).with_detail("reason", error.to_string())
}

/// Decode an inbound publish into the protocol-shaped data map
fn publish_data(publish: &rumqttc::Publish) -> Map<String, Value> {
    let decoded = match std::str::from_utf8(&publish.payload) {
        Ok(text) => serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::from(text)),
        Err(_) => Value::from(String::from_utf8_lossy(&publish.payload).to_string()),
    };

    let mut data = Map::new();
    data.insert("topic".to_string(), Value::from(publish.topic.clone()));
    data.insert("payload".to_string(), decoded);
    data.insert("qos".to_string(), Value::from(publish.qos as u8));
    data
}

#[async_trait]
impl ProtocolWorker for MqttWorker {
    async fn run(self: Box<Self>, mut ctx: WorkerContext) {
        let mut last_success: Option<SystemTime> = None;

        'connection: loop {
            let (client, mut eventloop) = AsyncClient::new(self.options(), 64);

            if let Err(error) = client.subscribe(self.topic.as_str(), QoS::AtLeastOnce).await {
                let probe_error =
                    ProbeError::new(ErrorKind::Protocol, "failed to subscribe to topic")
                        .with_detail("topic", self.topic.clone())
                        .with_detail("reason", error.to_string());
                match emit_and_await_recovery(&mut ctx, probe_error, last_success).await {
                    Recovered::Reconnect => continue 'connection,
                    Recovered::Stop => return,
                }
            }

            loop {
                tokio::select! {
                    command = ctx.commands.recv() => match command {
                        Some(RecoveryAction::Retry { delay }) => {
                            tokio::time::sleep(delay).await;
                            continue 'connection;
                        }
                        Some(RecoveryAction::Shutdown) | None => {
                            let _ = client.disconnect().await;
                            debug!(monitor = %ctx.monitor_id, "MQTT worker stopped");
                            return;
                        }
                    },
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let envelope =
                                Envelope::data(ctx.monitor_id.clone(), publish_data(&publish));
                            last_success = envelope.meta.last_success;
                            if !ctx.emit(envelope) {
                                return;
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            debug!(
                                monitor = %ctx.monitor_id,
                                host = %self.host,
                                "MQTT connection established"
                            );
                        }
                        Ok(_) => {}
                        Err(error) => {
                            let probe_error = classify_connection_error(&error);
                            match emit_and_await_recovery(&mut ctx, probe_error, last_success).await
                            {
                                Recovered::Reconnect => continue 'connection,
                                Recovered::Stop => return,
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaTable;
    use crate::validator::validate_document;
    use serde_json::json;

    fn schemas() -> SchemaTable {
        let mut table = SchemaTable::new();
        table.insert("mqtt".to_string(), MqttWorkerFactory.schema());
        table
    }

    #[test]
    fn test_defaults_and_generated_client_id() {
        let document = json!({
            "monitors": {"single": [{
                "name": "broker",
                "type": "mqtt",
                "config": {"host": "broker.local", "topic": "sensors/#"},
                "retry_policy": {"max_retries": 2, "retry_timeout": 500, "backoff_strategy": "fixed"}
            }]},
            "rules": [{"name": "r1", "monitor": "broker"}]
        });

        let records = validate_document(&document, &schemas()).unwrap();
        let worker = MqttWorker::from_config(&records[0].config);

        assert_eq!(worker.port, 1883);
        assert_eq!(worker.keep_alive, Duration::from_secs(60));
        assert!(worker.client_id.starts_with("argos-"));
        assert!(worker.username.is_none());
    }

    #[test]
    fn test_port_bounds() {
        let document = json!({
            "monitors": {"single": [{
                "name": "broker",
                "type": "mqtt",
                "config": {"host": "broker.local", "topic": "t", "port": 0},
                "retry_policy": {"max_retries": 2, "retry_timeout": 500, "backoff_strategy": "fixed"}
            }]},
            "rules": [{"name": "r1", "monitor": "broker"}]
        });

        let reasons = validate_document(&document, &schemas()).unwrap_err();
        assert!(reasons.iter().any(|r| r.contains("config.port: must be >= 1")));
    }

    #[test]
    fn test_publish_decoding() {
        let publish = rumqttc::Publish::new("sensors/temp", QoS::AtLeastOnce, "{\"c\": 21.5}");

        let data = publish_data(&publish);
        assert_eq!(data["topic"], "sensors/temp");
        assert_eq!(data["payload"]["c"], 21.5);
    }
}
