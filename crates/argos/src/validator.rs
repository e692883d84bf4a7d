//! Multi-pass document validator.
//!
//! Turns the loosely-typed monitor document into fully-typed
//! [`MonitorRecord`]s. Validation never short-circuits: every independent
//! fault across every monitor and rule is collected before returning, so
//! the operator sees the complete picture in one pass. Reasons are
//! deduplicated preserving first-occurrence order.

use serde_json::Value;

use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::schema::{ConfigValue, FieldSchema, ProtocolConfig, SchemaTable};

/// One validated monitor, immutable after validation
#[derive(Debug, Clone)]
pub struct MonitorRecord {
    /// Operator-assigned identifier, unique within the document
    pub name: String,

    /// Protocol tag resolving to an installed worker
    pub protocol: String,

    /// Typed configuration keyed by the protocol schema's field names
    pub config: ProtocolConfig,

    pub retry_policy: RetryPolicy,

    /// Rule names this monitor's envelopes are dispatched to
    pub inform_to: Vec<String>,
}

/// Order-preserving, deduplicating reason accumulator
#[derive(Debug, Default)]
struct Reasons {
    list: Vec<String>,
}

impl Reasons {
    fn push(&mut self, reason: String) {
        if !self.list.contains(&reason) {
            self.list.push(reason);
        }
    }

    fn into_result<T>(self, ok: T) -> Result<T, Vec<String>> {
        if self.list.is_empty() {
            Ok(ok)
        } else {
            Err(self.list)
        }
    }
}

/// A rule's contribution to the subscriber index
struct Rule {
    name: String,
    targets: Vec<String>,
}

/// Validate a raw document against the installed protocol schemas.
///
/// Returns the monitor table, or every reason the document is invalid.
pub fn validate_document(
    document: &Value,
    schemas: &SchemaTable,
) -> Result<Vec<MonitorRecord>, Vec<String>> {
    let mut reasons = Reasons::default();

    if !document.is_object() {
        reasons.push("Document must be a JSON object".to_string());
        return reasons.into_result(Vec::new());
    }

    // Pass 1: rule structural check, building the subscriber index
    let rules = collect_rules(document, &mut reasons);

    // Pass 2: per-monitor validation, each monitor independent of the rest
    let mut records = Vec::new();
    let mut seen_names: Vec<String> = Vec::new();
    for (index, entry) in document_monitors(document, &mut reasons).iter().enumerate() {
        if let Some(record) =
            validate_monitor(entry, index, schemas, &rules, &mut seen_names, &mut reasons)
        {
            records.push(record);
        }
    }

    reasons.into_result(records)
}

fn document_rules<'doc>(document: &'doc Value, reasons: &mut Reasons) -> &'doc [Value] {
    match document.get("rules") {
        None => &[],
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            reasons.push("Document 'rules' must be a list".to_string());
            &[]
        }
    }
}

fn document_monitors<'doc>(document: &'doc Value, reasons: &mut Reasons) -> &'doc [Value] {
    let monitors = match document.get("monitors") {
        None => return &[],
        Some(Value::Object(map)) => map,
        Some(_) => {
            reasons.push("Document 'monitors' must be a map".to_string());
            return &[];
        }
    };

    match monitors.get("single") {
        None => &[],
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            reasons.push("Document 'monitors.single' must be a list".to_string());
            &[]
        }
    }
}

/// Pass 1. Rules with errors still contribute whatever targets could be
/// recovered, so later coverage checks see the operator's intent.
fn collect_rules(document: &Value, reasons: &mut Reasons) -> Vec<Rule> {
    let mut rules = Vec::new();

    for entry in document_rules(document, reasons) {
        let Some(map) = entry.as_object() else {
            reasons.push("Rule 'UNKNOWN' must be a map".to_string());
            continue;
        };

        let name = match map.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                reasons.push("Rule 'UNKNOWN' must have a 'name' field".to_string());
                "UNKNOWN".to_string()
            }
        };

        let mut targets = Vec::new();
        match map.get("monitor") {
            Some(Value::String(target)) if !target.is_empty() => targets.push(target.clone()),
            Some(Value::String(_)) => {
                reasons.push(format!("Rule '{name}' has an empty 'monitor' target"));
            }
            Some(Value::Array(entries)) => {
                for target in entries {
                    match target.as_str() {
                        Some(target) if !target.is_empty() => targets.push(target.to_string()),
                        _ => reasons
                            .push(format!("Rule '{name}' has a non-string entry in 'monitor'")),
                    }
                }
            }
            _ => reasons.push(format!("Rule '{name}' must have a 'monitor' field")),
        }

        if name != "UNKNOWN" {
            rules.push(Rule { name, targets });
        }
    }

    rules
}

/// Pass 2, one monitor. Returns a record only when every check passed.
fn validate_monitor(
    entry: &Value,
    index: usize,
    schemas: &SchemaTable,
    rules: &[Rule],
    seen_names: &mut Vec<String>,
    reasons: &mut Reasons,
) -> Option<MonitorRecord> {
    let Some(map) = entry.as_object() else {
        reasons.push(format!("Monitor entry at index {index} must be a map"));
        return None;
    };

    let name = match map.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            reasons.push(format!("Monitor entry at index {index} must have a non-empty string 'name'"));
            return None;
        }
    };

    let mut duplicate = false;
    if seen_names.contains(&name) {
        reasons.push(format!("Monitor '{name}' is declared more than once"));
        duplicate = true;
    } else {
        seen_names.push(name.clone());
    }

    let protocol = match map.get("type").and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => {
            reasons.push(format!("Monitor '{name}' must have a string 'type'"));
            return None;
        }
    };
    let Some(schema) = schemas.get(&protocol) else {
        reasons.push(format!("Monitor '{name}' has unknown type '{protocol}'"));
        return None;
    };

    let retry_policy = validate_retry_policy(&name, map.get("retry_policy"), reasons);
    let config = validate_config(&name, map.get("config"), schema, reasons);
    let inform_to = compute_inform_to(&name, rules, reasons);

    match (retry_policy, config, inform_to, duplicate) {
        (Some(retry_policy), Some(config), Some(inform_to), false) => {
            Some(MonitorRecord { name, protocol, config, retry_policy, inform_to })
        }
        _ => None,
    }
}

/// Validate the `retry_policy` map: exactly `max_retries`, `retry_timeout`,
/// and `backoff_strategy`, each reported independently.
fn validate_retry_policy(
    monitor: &str,
    raw: Option<&Value>,
    reasons: &mut Reasons,
) -> Option<RetryPolicy> {
    let Some(map) = raw.and_then(Value::as_object) else {
        reasons.push(format!("Monitor '{monitor}' must have a 'retry_policy' map"));
        return None;
    };

    let mut ok = true;

    let max_retries = match map.get("max_retries") {
        Some(Value::Null) => None,
        Some(value) if value.as_u64().is_some_and(|n| u32::try_from(n).is_ok()) => {
            value.as_u64().and_then(|n| u32::try_from(n).ok())
        }
        _ => {
            reasons.push(format!(
                "Monitor '{monitor}' -> retry_policy.max_retries: must be a non-negative integer or null"
            ));
            ok = false;
            None
        }
    };

    let retry_timeout = match map.get("retry_timeout").and_then(Value::as_u64) {
        Some(ms) if ms > 0 => Some(ms),
        _ => {
            reasons.push(format!(
                "Monitor '{monitor}' -> retry_policy.retry_timeout: must be a positive integer"
            ));
            ok = false;
            None
        }
    };

    let backoff_strategy = match map.get("backoff_strategy").and_then(Value::as_str) {
        Some(strategy) => match strategy.parse::<BackoffStrategy>() {
            Ok(strategy) => Some(strategy),
            Err(_) => {
                reasons.push(format!(
                    "Monitor '{monitor}' -> retry_policy.backoff_strategy: must be one of fixed, linear, exponential"
                ));
                ok = false;
                None
            }
        },
        None => {
            reasons.push(format!(
                "Monitor '{monitor}' -> retry_policy.backoff_strategy: must be one of fixed, linear, exponential"
            ));
            ok = false;
            None
        }
    };

    for key in map.keys() {
        if !matches!(key.as_str(), "max_retries" | "retry_timeout" | "backoff_strategy") {
            reasons.push(format!("Monitor '{monitor}' -> retry_policy.{key}: unexpected field"));
            ok = false;
        }
    }

    if !ok {
        return None;
    }

    Some(RetryPolicy {
        max_retries,
        backoff_strategy: backoff_strategy?,
        retry_timeout: retry_timeout?,
    })
}

/// Validate `config` against the protocol's field schemas and type it,
/// applying declared defaults for absent optional fields.
fn validate_config(
    monitor: &str,
    raw: Option<&Value>,
    schema: &[FieldSchema],
    reasons: &mut Reasons,
) -> Option<ProtocolConfig> {
    let Some(map) = raw.and_then(Value::as_object) else {
        // Synthesize the per-field picture so the operator sees everything
        // wrong with this monitor at once.
        reasons.push(format!("Monitor '{monitor}' must have a 'config' map"));
        for field in schema.iter().filter(|field| field.required) {
            reasons.push(format!(
                "Monitor '{monitor}' -> config.{}: required field missing",
                field.name
            ));
        }
        return None;
    };

    let mut ok = true;
    let mut config = ProtocolConfig::new();

    for field in schema {
        match map.get(field.name) {
            Some(value) => match field.check(value) {
                Ok(typed) => {
                    config.insert(field.name.to_string(), typed);
                }
                Err(violation) => {
                    reasons.push(format!(
                        "Monitor '{monitor}' -> config.{}: {violation}",
                        field.name
                    ));
                    ok = false;
                }
            },
            None if field.required => {
                reasons.push(format!(
                    "Monitor '{monitor}' -> config.{}: required field missing",
                    field.name
                ));
                ok = false;
            }
            None => {
                if let Some(default) = &field.default {
                    config.insert(field.name.to_string(), default.clone());
                }
            }
        }
    }

    for key in map.keys() {
        if !schema.iter().any(|field| field.name == key) {
            reasons.push(format!("Monitor '{monitor}' -> config.{key}: unexpected field"));
            ok = false;
        }
    }

    ok.then_some(config)
}

/// Rule names targeting this monitor, in rule declaration order
fn compute_inform_to(monitor: &str, rules: &[Rule], reasons: &mut Reasons) -> Option<Vec<String>> {
    let mut inform_to: Vec<String> = Vec::new();
    for rule in rules {
        if rule.targets.iter().any(|target| target == monitor)
            && !inform_to.contains(&rule.name)
        {
            inform_to.push(rule.name.clone());
        }
    }

    if inform_to.is_empty() {
        reasons.push(format!("Monitor '{monitor}' is not targeted by any rule"));
        return None;
    }

    Some(inform_to)
}

/// Convenience accessors for typed protocol configs
pub trait ConfigExt {
    fn str_field(&self, name: &str) -> String;
    fn int_field(&self, name: &str) -> i64;
    fn bool_field(&self, name: &str) -> bool;
    fn map_field(&self, name: &str) -> serde_json::Map<String, Value>;
}

impl ConfigExt for ProtocolConfig {
    fn str_field(&self, name: &str) -> String {
        self.get(name).and_then(|v| v.as_str()).unwrap_or_default().to_string()
    }

    fn int_field(&self, name: &str) -> i64 {
        self.get(name).and_then(ConfigValue::as_int).unwrap_or_default()
    }

    fn bool_field(&self, name: &str) -> bool {
        self.get(name).and_then(ConfigValue::as_bool).unwrap_or_default()
    }

    fn map_field(&self, name: &str) -> serde_json::Map<String, Value> {
        self.get(name).and_then(|v| v.as_map()).cloned().unwrap_or_default()
    }
}
