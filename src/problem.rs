//! RFC 7807 problem details.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{wire, ApiResponse};

/// One per-field validation error.
///
/// `field` is empty when the server did not name one.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Structured error payload (RFC 7807).
///
/// Members outside the standard five are kept in `extensions`; validation
/// sub-errors are additionally decoded into `errors`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProblemDetail {
    /// URI reference identifying the problem type.
    pub type_uri: Option<String>,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub detail: Option<String>,
    /// URI reference identifying this occurrence.
    pub instance: Option<String>,
    pub errors: Vec<FieldError>,
    pub extensions: Map<String, Value>,
}

impl ProblemDetail {
    /// Parses a problem detail out of a response.
    ///
    /// Returns `None` when the body is not JSON, or when it is plain JSON
    /// (no `application/problem+json` content type) without any standard member.
    pub fn from_response(response: &ApiResponse) -> Option<Self> {
        Self::from_body(response.content_type(), response.body())
    }

    pub fn from_body(content_type: Option<&str>, body: &[u8]) -> Option<Self> {
        let declared = content_type.is_some_and(|value| {
            value
                .to_ascii_lowercase()
                .contains("application/problem+json")
        });
        let Value::Object(mut object) = serde_json::from_slice(body).ok()? else {
            return None;
        };
        if !declared
            && !wire::PROBLEM_MEMBERS
                .iter()
                .any(|member| object.contains_key(*member))
        {
            return None;
        }

        let type_uri = take_string(&mut object, "type");
        let title = take_string(&mut object, "title");
        let detail = take_string(&mut object, "detail");
        let instance = take_string(&mut object, "instance");
        let status = object
            .remove("status")
            .as_ref()
            .and_then(wire::number_value)
            .and_then(|value| u16::try_from(value).ok());

        let errors = wire::VALIDATION_MEMBERS
            .iter()
            .find_map(|member| object.get(*member))
            .map(decode_field_errors)
            .unwrap_or_default();

        Some(Self {
            type_uri,
            title,
            status,
            detail,
            instance,
            errors,
            extensions: object,
        })
    }

    /// Renders the problem as a multi-line human message.
    pub fn to_message(&self) -> String {
        let mut lines = Vec::new();

        match (&self.title, &self.detail) {
            (Some(title), Some(detail)) if title != detail => {
                lines.push(title.clone());
                lines.push(detail.clone());
            }
            (Some(title), _) => lines.push(title.clone()),
            (None, Some(detail)) => lines.push(detail.clone()),
            (None, None) => {}
        }
        if let Some(type_uri) = &self.type_uri {
            lines.push(format!("Problem Type: {type_uri}"));
        }
        if let Some(instance) = &self.instance {
            lines.push(format!("Instance: {instance}"));
        }
        if !self.extensions.is_empty() {
            lines.push("Extension fields:".to_owned());
            for (key, value) in &self.extensions {
                lines.push(format!("  - {key}: {value}"));
            }
        }

        if lines.is_empty() {
            "Unknown API error".to_owned()
        } else {
            lines.join("\n")
        }
    }
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key)? {
        Value::String(value) => Some(value),
        _ => None,
    }
}

fn decode_field_errors(value: &Value) -> Vec<FieldError> {
    let Value::Array(entries) = value else {
        return Vec::new();
    };
    entries.iter().map(decode_field_error).collect()
}

/// Every entry yields one error; unrecognised shapes keep their JSON text as
/// the message.
fn decode_field_error(entry: &Value) -> FieldError {
    let object = match entry {
        Value::Object(object) => object,
        Value::String(text) => return FieldError::new("", text.as_str()),
        other => return FieldError::new("", other.to_string()),
    };
    let field = wire::FIELD_ERROR_FIELD_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(path_text)
        .unwrap_or_default();
    let message = wire::FIELD_ERROR_MESSAGE_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(scalar_text)
        .unwrap_or_else(|| entry.to_string());
    FieldError { field, message }
}

fn path_text(value: &Value) -> Option<String> {
    match value {
        Value::Array(segments) => {
            let parts: Vec<String> = segments.iter().filter_map(scalar_text).collect();
            (!parts.is_empty()).then(|| parts.join("."))
        }
        other => scalar_text(other),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
