//! WebSocket streaming worker.
//!
//! Push-based: holds one connection open and emits a success envelope per
//! inbound text or binary frame. Pings are answered transparently. On close
//! or transport error it emits a classified error envelope and suspends
//! until the coordinator answers with a recovery command.

use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use super::{emit_and_await_recovery, ProtocolWorker, Recovered, WorkerContext, WorkerFactory};
use crate::envelope::{Envelope, ErrorKind, ProbeError};
use crate::retry::RecoveryAction;
use crate::schema::{ConfigValue, FieldSchema, FieldType, ProtocolConfig};
use crate::validator::ConfigExt;

pub struct WebSocketWorkerFactory;

impl WorkerFactory for WebSocketWorkerFactory {
    fn tag(&self) -> &'static str {
        "websocket"
    }

    fn schema(&self) -> Vec<FieldSchema> {
        vec![
            FieldSchema::required("url", FieldType::String)
                .pattern("^wss?://.+")
                .custom(url_parses),
            FieldSchema::optional("headers", FieldType::Map, ConfigValue::Map(Map::new())),
        ]
    }

    fn build(&self, config: &ProtocolConfig) -> Box<dyn ProtocolWorker> {
        Box::new(WebSocketWorker::from_config(config))
    }
}

fn url_parses(value: &ConfigValue) -> Result<(), String> {
    let Some(raw) = value.as_str() else { return Ok(()) };
    match url::Url::parse(raw) {
        Ok(_) => Ok(()),
        Err(error) => Err(format!("invalid URL: {error}")),
    }
}

pub(crate) struct WebSocketWorker {
    url: String,
    headers: Map<String, Value>,
}

impl WebSocketWorker {
    pub(crate) fn from_config(config: &ProtocolConfig) -> Self {
        Self { url: config.str_field("url"), headers: config.map_field("headers") }
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ProbeError> {
        let mut request = self.url.as_str().into_client_request().map_err(|error| {
            ProbeError::new(ErrorKind::ClientError, "invalid websocket URL")
                .with_detail("reason", error.to_string())
        })?;

        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|error| {
                ProbeError::new(ErrorKind::Exception, "invalid header name")
                    .with_detail("kind", "request_build")
                    .with_detail("error", error.to_string())
            })?;
            let value_str = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let value = HeaderValue::from_str(&value_str).map_err(|error| {
                ProbeError::new(ErrorKind::Exception, "invalid header value")
                    .with_detail("kind", "request_build")
                    .with_detail("error", error.to_string())
            })?;
            request.headers_mut().insert(name, value);
        }

        Ok(request)
    }
}

fn classify_ws_error(error: &WsError) -> ProbeError {
    let (kind, message) = match error {
        WsError::Io(_) => (ErrorKind::Network, "websocket transport failure"),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            (ErrorKind::Network, "websocket connection closed")
        }
        WsError::Protocol(_) => (ErrorKind::Protocol, "websocket protocol violation"),
        WsError::Http(response) => {
            return ProbeError::new(ErrorKind::HttpError, "websocket handshake rejected")
                .with_detail("status_code", response.status().as_u16())
                .with_detail("reason", error.to_string());
        }
        WsError::Url(_) => (ErrorKind::ClientError, "invalid websocket URL"),
        _ => (ErrorKind::Unknown, "websocket failure"),
    };

    ProbeError::new(kind, message).with_detail("reason", error.to_string())
}

/// Decode an inbound frame into the protocol-shaped data map
fn frame_data(message: &Message) -> Map<String, Value> {
    let mut data = Map::new();
    match message {
        Message::Text(text) => {
            let decoded = serde_json::from_str::<Value>(text)
                .unwrap_or_else(|_| Value::from(text.to_string()));
            data.insert("kind".to_string(), Value::from("text"));
            data.insert("message".to_string(), decoded);
        }
        Message::Binary(bytes) => {
            data.insert("kind".to_string(), Value::from("binary"));
            data.insert("size".to_string(), Value::from(bytes.len()));
            data.insert(
                "message".to_string(),
                Value::from(String::from_utf8_lossy(bytes).to_string()),
            );
        }
        _ => {}
    }
    data
}

#[async_trait]
impl ProtocolWorker for WebSocketWorker {
    async fn run(self: Box<Self>, mut ctx: WorkerContext) {
        let mut last_success: Option<SystemTime> = None;

        'connection: loop {
            let request = match self.build_request() {
                Ok(request) => request,
                Err(error) => match emit_and_await_recovery(&mut ctx, error, last_success).await {
                    Recovered::Reconnect => continue 'connection,
                    Recovered::Stop => return,
                },
            };

            let mut stream = match connect_async(request).await {
                Ok((stream, _response)) => {
                    debug!(monitor = %ctx.monitor_id, url = %self.url, "WebSocket connected");
                    stream
                }
                Err(error) => {
                    let error = classify_ws_error(&error);
                    match emit_and_await_recovery(&mut ctx, error, last_success).await {
                        Recovered::Reconnect => continue 'connection,
                        Recovered::Stop => return,
                    }
                }
            };

            // One iteration per frame; leaves the inner loop only to
            // reconnect or stop.
            loop {
                let error = tokio::select! {
                    command = ctx.commands.recv() => match command {
                        Some(RecoveryAction::Retry { delay }) => {
                            tokio::time::sleep(delay).await;
                            continue 'connection;
                        }
                        Some(RecoveryAction::Shutdown) | None => {
                            let _ = stream.close(None).await;
                            debug!(monitor = %ctx.monitor_id, "WebSocket worker stopped");
                            return;
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                            let envelope =
                                Envelope::data(ctx.monitor_id.clone(), frame_data(&message));
                            last_success = envelope.meta.last_success;
                            if !ctx.emit(envelope) {
                                return;
                            }
                            continue;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            match stream.send(Message::Pong(payload)).await {
                                Ok(()) => continue,
                                Err(error) => classify_ws_error(&error),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let mut error = ProbeError::new(
                                ErrorKind::Network,
                                "websocket closed by peer",
                            );
                            if let Some(frame) = frame {
                                error = error
                                    .with_detail("code", u16::from(frame.code))
                                    .with_detail("reason", frame.reason.to_string());
                            }
                            error
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(error)) => classify_ws_error(&error),
                        None => ProbeError::new(ErrorKind::Network, "websocket stream ended"),
                    }
                };

                match emit_and_await_recovery(&mut ctx, error, last_success).await {
                    Recovered::Reconnect => continue 'connection,
                    Recovered::Stop => return,
                }
            }
        }
    }
}
