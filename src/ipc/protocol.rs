//! Message shapes exchanged with the supervised processes
//!
//! Peers own the field-level schema. The orchestrator only needs to tell
//! commands (`{cmd, ...}`) from responses (`{ret}`) and keeps everything
//! else intact as an opaque value so no collaborator field gets dropped.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// A message read from or written to a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request: `{"cmd": "...", ...args}`
    Command(CommandMessage),
    /// Response to an earlier request: `{"ret": ...}`
    Return(Value),
    /// Anything the orchestrator does not interpret
    Opaque(Value),
}

impl Message {
    /// Wrap a value as a response
    pub fn ret(value: Value) -> Self {
        Self::Return(value)
    }

    /// Classify a raw wire value
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::Opaque(value);
        };

        match map.remove("cmd") {
            Some(Value::String(cmd)) => Self::Command(CommandMessage { cmd, args: map }),
            Some(other) => {
                map.insert("cmd".to_string(), other);
                Self::Opaque(Value::Object(map))
            }
            None if map.len() == 1 && map.contains_key("ret") => {
                Self::Return(map.remove("ret").unwrap_or(Value::Null))
            }
            None => Self::Opaque(Value::Object(map)),
        }
    }

    /// Convert back to the wire representation
    pub fn to_value(&self) -> Value {
        match self {
            Self::Command(command) => command.to_value(),
            Self::Return(value) => serde_json::json!({ "ret": value }),
            Self::Opaque(value) => value.clone(),
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// A `{cmd, ...args}` request
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub cmd: String,
    pub args: Map<String, Value>,
}

impl CommandMessage {
    /// Boolean-ish argument, absent means false
    pub fn flag(&self, key: &str) -> bool {
        self.args.get(key).map(truthy).unwrap_or(false)
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    fn to_value(&self) -> Value {
        let mut map = self.args.clone();
        map.insert("cmd".to_string(), Value::String(self.cmd.clone()));
        Value::Object(map)
    }
}

/// Loose truthiness used by the peers: `0`, `""`, `"0"`, `false` and
/// `null` are false, everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Backend answer to `check_asserted_screen`
///
/// Carries `found` and/or `timeout` plus whatever else the backend reports.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScreenCheckResult(Map<String, Value>);

impl ScreenCheckResult {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    /// A match was found or the check gave up
    pub fn is_conclusive(&self) -> bool {
        ["found", "timeout"]
            .iter()
            .any(|key| self.0.get(*key).map(truthy).unwrap_or(false))
    }

    pub fn set_tags(&mut self, tags: &[String]) {
        self.0.insert(
            "tags".to_string(),
            Value::Array(tags.iter().cloned().map(Value::String).collect()),
        );
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}
