use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Classification of an operational probe failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Protocol,
    Authentication,
    Timeout,
    Parse,
    Redirect,
    HttpError,
    ClientError,
    Exception,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Authentication => write!(f, "authentication"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Redirect => write!(f, "redirect"),
            ErrorKind::HttpError => write!(f, "http_error"),
            ErrorKind::ClientError => write!(f, "client_error"),
            ErrorKind::Exception => write!(f, "exception"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Connection-level status carried in every envelope's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Connecting,
    Error,
}

/// Classified failure emitted in the error arm of an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeError {
    /// Failure classification
    #[serde(rename = "type")]
    pub kind: ErrorKind,

    /// Human-readable summary of the failure
    pub message: String,

    /// Transport-specific context (status codes, response bodies, reasons)
    pub details: Map<String, Value>,

    /// When the failure was observed (UTC)
    pub timestamp: SystemTime,

    /// Captured stack trace, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl ProbeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Map::new(),
            timestamp: SystemTime::now(),
            stacktrace: None,
        }
    }

    /// Attach one transport-specific detail entry
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }
}

/// Metadata attached to every envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// Connection status of the emitting worker
    pub status: LinkStatus,

    /// Most recent successful probe, if any (UTC)
    pub last_success: Option<SystemTime>,
}

/// The two arms of the envelope union. Exactly one is ever populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Payload {
    /// Successful probe carrying a protocol-shaped data map
    #[serde(rename = "ok")]
    Data { data: Map<String, Value> },

    /// Classified operational failure
    Error { error: ProbeError },
}

/// The single record shape crossing every internal boundary.
///
/// Protocol workers emit envelopes to their coordinator; coordinators fan
/// them out to subscribers unchanged. Downstream consumers never see
/// transport-specific types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Identifier of the monitor this envelope belongs to
    pub monitor_id: String,

    /// When the envelope was produced (UTC)
    pub timestamp: SystemTime,

    #[serde(flatten)]
    pub payload: Payload,

    pub meta: EnvelopeMeta,
}

impl Envelope {
    /// Build a success envelope. Stamps `meta.last_success` with now.
    pub fn data(monitor_id: impl Into<String>, data: Map<String, Value>) -> Self {
        let now = SystemTime::now();
        Self {
            monitor_id: monitor_id.into(),
            timestamp: now,
            payload: Payload::Data { data },
            meta: EnvelopeMeta { status: LinkStatus::Connected, last_success: Some(now) },
        }
    }

    /// Build an error envelope carrying the last known success instant.
    pub fn error(
        monitor_id: impl Into<String>,
        error: ProbeError,
        last_success: Option<SystemTime>,
    ) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            timestamp: SystemTime::now(),
            payload: Payload::Error { error },
            meta: EnvelopeMeta { status: LinkStatus::Error, last_success },
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self.payload, Payload::Data { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, Payload::Error { .. })
    }

    /// The failure classification, for error envelopes
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.payload {
            Payload::Error { error } => Some(error.kind),
            Payload::Data { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_envelope_shape() {
        let mut data = Map::new();
        data.insert("status_code".to_string(), Value::from(200));

        let envelope = Envelope::data("m1", data);
        assert!(envelope.is_data());
        assert!(!envelope.is_error());
        assert_eq!(envelope.monitor_id, "m1");
        assert_eq!(envelope.meta.status, LinkStatus::Connected);
        assert!(envelope.meta.last_success.is_some());

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"]["status_code"], 200);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_envelope_shape() {
        let error = ProbeError::new(ErrorKind::HttpError, "HTTP 404")
            .with_detail("status_code", 404)
            .with_detail("body", "not found");

        let envelope = Envelope::error("m1", error, None);
        assert!(envelope.is_error());
        assert_eq!(envelope.error_kind(), Some(ErrorKind::HttpError));
        assert_eq!(envelope.meta.status, LinkStatus::Error);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["type"], "http_error");
        assert_eq!(json["error"]["details"]["status_code"], 404);
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::error("m2", ProbeError::new(ErrorKind::Timeout, "timed out"), None);
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.monitor_id, "m2");
        assert_eq!(back.error_kind(), Some(ErrorKind::Timeout));
    }
}
