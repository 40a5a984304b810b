//! Envelope view of an inbound frame.
//!
//! Only the addressing fields are read. The frame itself is forwarded
//! byte-for-byte, so nothing here ever re-serializes a message.

use serde_json::{Map, Value};

pub const HEARTBEAT_TYPE: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// No `to` field, or one that addresses nobody. Accepted, not routed.
    None,
    One(String),
    Many(Vec<String>),
}

impl Targets {
    pub fn len(&self) -> usize {
        match self {
            Targets::None => 0,
            Targets::One(_) => 1,
            Targets::Many(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let ids: &[String] = match self {
            Targets::None => &[],
            Targets::One(id) => std::slice::from_ref(id),
            Targets::Many(ids) => ids,
        };
        ids.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Claimed sender. Never checked against the sending connection.
    pub from: String,
    pub to: Targets,
    pub kind: String,
}

#[derive(Debug)]
pub struct MalformedFrame(pub String);

impl std::fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed frame: {}", self.0)
    }
}

impl std::error::Error for MalformedFrame {}

impl Envelope {
    pub fn parse(frame: &[u8]) -> Result<Self, MalformedFrame> {
        let value: Value =
            serde_json::from_slice(frame).map_err(|e| MalformedFrame(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| MalformedFrame("expected a JSON object".to_string()))?;

        Ok(Self {
            from: text_field(object, "from"),
            to: object.get("to").map(resolve_targets).unwrap_or(Targets::None),
            kind: text_field(object, "type"),
        })
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == HEARTBEAT_TYPE
    }
}

fn text_field(object: &Map<String, Value>, key: &str) -> String {
    object.get(key).and_then(target_id).unwrap_or_default()
}

/// Strings address themselves, numbers by their decimal text.
fn target_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_targets(to: &Value) -> Targets {
    match to {
        Value::Array(items) => Targets::Many(items.iter().filter_map(target_id).collect()),
        other => target_id(other).map(Targets::One).unwrap_or(Targets::None),
    }
}

/// Optional payload check run before any routing.
pub trait PayloadValidator: Send + Sync {
    /// `Err` carries human-readable reasons.
    fn validate(&self, payload: &[u8]) -> Result<(), Vec<String>>;
}

/// Checks the envelope fields the relay relies on have the expected types.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeShapeValidator;

impl PayloadValidator for EnvelopeShapeValidator {
    fn validate(&self, payload: &[u8]) -> Result<(), Vec<String>> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| vec![e.to_string()])?;
        let Some(object) = value.as_object() else {
            return Err(vec!["message must be a JSON object".to_string()]);
        };

        let mut reasons = Vec::new();
        for key in ["from", "type"] {
            if let Some(v) = object.get(key) {
                if !v.is_string() {
                    reasons.push(format!("`{key}` must be a string"));
                }
            }
        }
        match object.get("to") {
            None | Some(Value::String(_)) => {}
            Some(Value::Array(items)) => {
                if let Some(pos) = items.iter().position(|v| !v.is_string()) {
                    reasons.push(format!("`to[{pos}]` must be a string"));
                }
            }
            Some(_) => reasons.push("`to` must be a string or an array of strings".to_string()),
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}

/// Checks every frame against a compiled JSON Schema document.
pub struct JsonSchemaValidator {
    validator: jsonschema::Validator,
}

impl JsonSchemaValidator {
    /// Compile `schema`. `Err` says why the document is not a usable schema.
    pub fn new(schema: &Value) -> Result<Self, String> {
        jsonschema::validator_for(schema)
            .map(|validator| Self { validator })
            .map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator").finish_non_exhaustive()
    }
}

impl PayloadValidator for JsonSchemaValidator {
    fn validate(&self, payload: &[u8]) -> Result<(), Vec<String>> {
        let instance: Value = serde_json::from_slice(payload).map_err(|e| vec![e.to_string()])?;
        let reasons: Vec<String> = self
            .validator
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}
