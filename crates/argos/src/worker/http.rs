//! HTTP polling worker.
//!
//! Probes the configured URL on a periodic timer (first fire immediately),
//! classifies each outcome, and emits one envelope per probe. On success it
//! schedules the next probe itself; after an error it suspends and waits
//! for the coordinator's recovery command.

use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use reqwest::{header::LOCATION, redirect, Client, Method};
use serde_json::{Map, Value};
use tracing::debug;

use super::{ProtocolWorker, WorkerContext, WorkerFactory};
use crate::envelope::{Envelope, ErrorKind, ProbeError};
use crate::retry::RecoveryAction;
use crate::schema::{ConfigValue, FieldSchema, FieldType, ProtocolConfig};
use crate::validator::ConfigExt;

pub struct HttpWorkerFactory;

impl WorkerFactory for HttpWorkerFactory {
    fn tag(&self) -> &'static str {
        "http"
    }

    fn schema(&self) -> Vec<FieldSchema> {
        vec![
            FieldSchema::required("url", FieldType::String)
                .pattern("^https?://.+")
                .custom(url_parses),
            FieldSchema::optional("method", FieldType::String, ConfigValue::Str("GET".to_string()))
                .custom(method_supported),
            FieldSchema::optional("headers", FieldType::Map, ConfigValue::Map(Map::new())),
            FieldSchema::required("interval", FieldType::Integer).bounds(100, 3_600_000),
            FieldSchema::optional("timeout", FieldType::Integer, ConfigValue::Int(5000))
                .bounds(100, 30_000),
            FieldSchema::optional("follow_redirect", FieldType::Boolean, ConfigValue::Bool(true)),
            FieldSchema::optional("verify_ssl", FieldType::Boolean, ConfigValue::Bool(false)),
            FieldSchema::optional(
                "request_body",
                FieldType::String,
                ConfigValue::Str(String::new()),
            ),
            FieldSchema::optional("request_params", FieldType::Map, ConfigValue::Map(Map::new())),
        ]
    }

    fn build(&self, config: &ProtocolConfig) -> Box<dyn ProtocolWorker> {
        Box::new(HttpWorker::from_config(config))
    }
}

fn url_parses(value: &ConfigValue) -> Result<(), String> {
    let Some(raw) = value.as_str() else { return Ok(()) };
    match url::Url::parse(raw) {
        Ok(_) => Ok(()),
        Err(error) => Err(format!("invalid URL: {error}")),
    }
}

fn method_supported(value: &ConfigValue) -> Result<(), String> {
    let Some(method) = value.as_str() else { return Ok(()) };
    match method.to_uppercase().as_str() {
        "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "PATCH" => Ok(()),
        other => Err(format!("unsupported HTTP method '{other}'")),
    }
}

pub(crate) struct HttpWorker {
    url: String,
    method: String,
    headers: Map<String, Value>,
    interval: Duration,
    timeout: Duration,
    follow_redirect: bool,
    verify_ssl: bool,
    request_body: String,
    request_params: Map<String, Value>,
}

impl HttpWorker {
    pub(crate) fn from_config(config: &ProtocolConfig) -> Self {
        Self {
            url: config.str_field("url"),
            method: config.str_field("method"),
            headers: config.map_field("headers"),
            interval: Duration::from_millis(config.int_field("interval").max(0) as u64),
            timeout: Duration::from_millis(config.int_field("timeout").max(0) as u64),
            follow_redirect: config.bool_field("follow_redirect"),
            verify_ssl: config.bool_field("verify_ssl"),
            request_body: config.str_field("request_body"),
            request_params: config.map_field("request_params"),
        }
    }

    fn client(&self) -> reqwest::Result<Client> {
        let redirect_policy = if self.follow_redirect {
            redirect::Policy::limited(10)
        } else {
            redirect::Policy::none()
        };

        Client::builder()
            .timeout(self.timeout)
            .redirect(redirect_policy)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .user_agent(concat!("argos/", env!("CARGO_PKG_VERSION")))
            .build()
    }

    /// Perform one probe and classify the outcome.
    async fn probe(&self, client: &Client) -> Result<Map<String, Value>, ProbeError> {
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes()).map_err(|error| {
            ProbeError::new(ErrorKind::Exception, format!("invalid HTTP method: {error}"))
                .with_detail("kind", "request_build")
                .with_detail("error", error.to_string())
        })?;

        let started = Instant::now();
        let mut request = client.request(method, &self.url);

        if !self.request_params.is_empty() {
            let pairs: Vec<(String, String)> = self
                .request_params
                .iter()
                .map(|(key, value)| (key.clone(), json_to_plain_string(value)))
                .collect();
            request = request.query(&pairs);
        }

        for (key, value) in &self.headers {
            request = request.header(key, json_to_plain_string(value));
        }

        if !self.request_body.is_empty() {
            request = request.body(self.request_body.clone());
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let status = response.status();
        let headers = extract_headers(&response);

        if status.is_redirection() {
            let redirect_url = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(ProbeError::new(
                ErrorKind::Redirect,
                format!("HTTP {} redirect not followed", status.as_u16()),
            )
            .with_detail("status_code", status.as_u16())
            .with_detail("redirect_url", redirect_url));
        }

        let body = response.text().await.map_err(|error| {
            ProbeError::new(ErrorKind::Network, "failed to read response body")
                .with_detail("reason", error.to_string())
        })?;

        if status.is_success() {
            let decoded = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
            let mut data = Map::new();
            data.insert("status_code".to_string(), Value::from(status.as_u16()));
            data.insert("body".to_string(), decoded);
            data.insert("headers".to_string(), Value::Object(headers));
            data.insert("duration_ms".to_string(), Value::from(duration_ms));
            Ok(data)
        } else {
            Err(ProbeError::new(ErrorKind::HttpError, format!("HTTP {}", status.as_u16()))
                .with_detail("status_code", status.as_u16())
                .with_detail("body", body))
        }
    }
}

/// Flatten a JSON value into the string form sent on the wire
fn json_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn extract_headers(response: &reqwest::Response) -> Map<String, Value> {
    response
        .headers()
        .iter()
        .map(|(name, value)| {
            (name.to_string(), Value::from(String::from_utf8_lossy(value.as_bytes()).to_string()))
        })
        .collect()
}

fn classify_send_error(error: reqwest::Error) -> ProbeError {
    if error.is_timeout() {
        ProbeError::new(ErrorKind::Timeout, "request timed out")
            .with_detail("reason", error.to_string())
    } else if error.is_builder() {
        ProbeError::new(ErrorKind::Exception, "failed to build request")
            .with_detail("kind", "request_build")
            .with_detail("error", error.to_string())
    } else {
        ProbeError::new(ErrorKind::ClientError, "request failed")
            .with_detail("reason", error.to_string())
    }
}

#[async_trait]
impl ProtocolWorker for HttpWorker {
    async fn run(self: Box<Self>, mut ctx: WorkerContext) {
        // A client that cannot be constructed fails every probe the same
        // way; still honor the recover protocol rather than bailing out.
        let client = loop {
            match self.client() {
                Ok(client) => break client,
                Err(error) => {
                    let probe_error =
                        ProbeError::new(ErrorKind::Exception, "failed to build HTTP client")
                            .with_detail("kind", "client_build")
                            .with_detail("error", error.to_string());
                    if !ctx.emit(Envelope::error(ctx.monitor_id.clone(), probe_error, None)) {
                        return;
                    }
                    match ctx.await_recovery().await {
                        Some(RecoveryAction::Retry { delay }) => tokio::time::sleep(delay).await,
                        Some(RecoveryAction::Shutdown) | None => return,
                    }
                }
            }
        };

        let mut last_success: Option<SystemTime> = None;
        let mut next_fire = tokio::time::Instant::now();
        let mut armed = true;

        loop {
            tokio::select! {
                command = ctx.commands.recv() => match command {
                    Some(RecoveryAction::Retry { delay }) => {
                        next_fire = tokio::time::Instant::now() + delay;
                        armed = true;
                    }
                    Some(RecoveryAction::Shutdown) | None => break,
                },
                _ = tokio::time::sleep_until(next_fire), if armed => {
                    let envelope = match self.probe(&client).await {
                        Ok(data) => {
                            let envelope = Envelope::data(ctx.monitor_id.clone(), data);
                            last_success = envelope.meta.last_success;
                            envelope
                        }
                        Err(error) => {
                            Envelope::error(ctx.monitor_id.clone(), error, last_success)
                        }
                    };

                    let succeeded = envelope.is_data();
                    if !ctx.emit(envelope) {
                        break;
                    }

                    if succeeded {
                        next_fire = tokio::time::Instant::now() + self.interval;
                    } else {
                        // Wait for the coordinator's verdict
                        armed = false;
                    }
                }
            }
        }

        debug!(monitor = %ctx.monitor_id, "HTTP worker stopped");
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
        table.insert("http".to_string(), HttpWorkerFactory.schema());
        table
    }

    #[test]
    fn test_defaults_applied() {
        let document = json!({
            "monitors": {"single": [{
                "name": "m1",
                "type": "http",
                "config": {"url": "http://example.com", "interval": 1000},
                "retry_policy": {"max_retries": 1, "retry_timeout": 500, "backoff_strategy": "fixed"}
            }]},
            "rules": [{"name": "r1", "monitor": "m1"}]
        });

        let records = validate_document(&document, &schemas()).unwrap();
        let worker = HttpWorker::from_config(&records[0].config);

        assert_eq!(worker.method, "GET");
        assert_eq!(worker.timeout, Duration::from_millis(5000));
        assert!(worker.follow_redirect);
        assert!(!worker.verify_ssl);
        assert!(worker.request_body.is_empty());
        assert!(worker.headers.is_empty());
    }

    #[test]
    fn test_method_predicate() {
        assert!(method_supported(&ConfigValue::Str("get".to_string())).is_ok());
        assert!(method_supported(&ConfigValue::Str("PATCH".to_string())).is_ok());
        assert!(method_supported(&ConfigValue::Str("TRACE".to_string())).is_err());
    }

    #[test]
    fn test_schema_rejects_bad_url_and_interval() {
        let document = json!({
            "monitors": {"single": [{
                "name": "m1",
                "type": "http",
                "config": {"url": "file:///etc/passwd", "interval": 50},
                "retry_policy": {"max_retries": 1, "retry_timeout": 500, "backoff_strategy": "fixed"}
            }]},
            "rules": [{"name": "r1", "monitor": "m1"}]
        });

        let reasons = validate_document(&document, &schemas()).unwrap_err();
        assert!(reasons.iter().any(|r| r.contains("config.url: must match pattern")));
        assert!(reasons.iter().any(|r| r.contains("config.interval: must be >= 100")));
    }
}
