//! Declarative field schemas for protocol configurations.
//!
//! Each protocol worker advertises the fields its `config` map accepts as a
//! list of [`FieldSchema`] values. The validator checks a raw JSON document
//! against these schemas and produces fully-typed configuration maps.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Expected type of one configuration field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Map,
    List(Box<FieldType>),
    /// Closed set of accepted string values
    Enum(Vec<&'static str>),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "a string"),
            FieldType::Integer => write!(f, "an integer"),
            FieldType::Float => write!(f, "a number"),
            FieldType::Boolean => write!(f, "a boolean"),
            FieldType::Map => write!(f, "a map"),
            FieldType::List(inner) => write!(f, "a list of {inner}"),
            FieldType::Enum(values) => write!(f, "one of {}", values.join(", ")),
        }
    }
}

/// A fully-typed configuration value produced by validation
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Map(Map<String, Value>),
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        match self {
            ConfigValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// Typed configuration map keyed by schema field names
pub type ProtocolConfig = BTreeMap<String, ConfigValue>;

/// Protocol tag to field-schema list, built from the installed workers
pub type SchemaTable = HashMap<String, Vec<FieldSchema>>;

/// Custom validation predicate: ok or a reason
pub type CustomCheck = fn(&ConfigValue) -> Result<(), String>;

/// Violation of one field schema rule
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldViolation {
    #[error("required field missing")]
    Missing,
    #[error("must be {0}")]
    WrongType(String),
    #[error("must be >= {0}")]
    BelowMin(i64),
    #[error("must be <= {0}")]
    AboveMax(i64),
    #[error("must match pattern {0}")]
    PatternMismatch(String),
    #[error("{0}")]
    Custom(String),
}

/// Declarative description of one expected configuration field
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<ConfigValue>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub pattern: Option<Regex>,
    pub custom: Option<CustomCheck>,
}

impl FieldSchema {
    /// A field that must be present
    pub fn required(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty, required: true, default: None, min: None, max: None, pattern: None, custom: None }
    }

    /// A field that falls back to `default` when absent
    pub fn optional(name: &'static str, ty: FieldType, default: ConfigValue) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: Some(default),
            min: None,
            max: None,
            pattern: None,
            custom: None,
        }
    }

    /// A field that may be present but has no fallback value
    pub fn allowed(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty, required: false, default: None, min: None, max: None, pattern: None, custom: None }
    }

    /// Inclusive numeric bounds
    pub fn bounds(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Regex the (string) value must match. `pattern` is a compile-time
    /// constant supplied by the worker implementation.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(Regex::new(pattern).expect("field pattern must compile"));
        self
    }

    pub fn custom(mut self, check: CustomCheck) -> Self {
        self.custom = Some(check);
        self
    }

    /// Check a raw JSON value against this schema and type it.
    pub fn check(&self, raw: &Value) -> Result<ConfigValue, FieldViolation> {
        let typed = coerce(raw, &self.ty)
            .ok_or_else(|| FieldViolation::WrongType(self.ty.to_string()))?;

        let numeric = match &typed {
            ConfigValue::Int(n) => Some(*n as f64),
            ConfigValue::Float(f) => Some(*f),
            _ => None,
        };
        if let Some(n) = numeric {
            if let Some(min) = self.min {
                if n < min as f64 {
                    return Err(FieldViolation::BelowMin(min));
                }
            }
            if let Some(max) = self.max {
                if n > max as f64 {
                    return Err(FieldViolation::AboveMax(max));
                }
            }
        }

        if let (Some(pattern), ConfigValue::Str(s)) = (&self.pattern, &typed) {
            if !pattern.is_match(s) {
                return Err(FieldViolation::PatternMismatch(pattern.as_str().to_string()));
            }
        }

        if let Some(check) = self.custom {
            check(&typed).map_err(FieldViolation::Custom)?;
        }

        Ok(typed)
    }
}

/// Type a raw JSON value, or None when it does not fit
fn coerce(raw: &Value, ty: &FieldType) -> Option<ConfigValue> {
    match ty {
        FieldType::String => raw.as_str().map(|s| ConfigValue::Str(s.to_string())),
        FieldType::Integer => raw.as_i64().map(ConfigValue::Int),
        FieldType::Float => raw.as_f64().map(ConfigValue::Float),
        FieldType::Boolean => raw.as_bool().map(ConfigValue::Bool),
        FieldType::Map => raw.as_object().map(|m| ConfigValue::Map(m.clone())),
        FieldType::List(inner) => {
            let items = raw.as_array()?;
            let typed: Option<Vec<ConfigValue>> =
                items.iter().map(|item| coerce(item, inner)).collect();
            typed.map(ConfigValue::List)
        }
        FieldType::Enum(values) => {
            let s = raw.as_str()?;
            values.iter().any(|allowed| *allowed == s).then(|| ConfigValue::Str(s.to_string()))
        }
    }
}
