//! Sensitive-field redaction applied to audit payloads before they are queued.

use serde_json::Value;

/// Marker written in place of a redacted value.
pub const REDACTED_MARKER: &str = "[REDACTED]";

/// Field names redacted when no explicit list is configured.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
    "credential",
    "private_key",
];

/// Replaces values of sensitive keys anywhere in a JSON document.
///
/// A key is sensitive when its lowercase form contains any configured name,
/// so `GITHUB_TOKEN` and `access_token` both match `token`.
#[derive(Debug, Clone)]
pub struct Redactor {
    fields: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_FIELDS)
    }
}

impl Redactor {
    /// Build a redactor for the given field names.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| f.as_ref().trim().to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    /// Whether `key` names a sensitive field.
    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.fields.iter().any(|field| key.contains(field.as_str()))
    }

    /// Redact `value` in place.
    pub fn redact(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.is_sensitive(key) {
                        *child = Value::String(REDACTED_MARKER.to_string());
                    } else {
                        self.redact(child);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact(item);
                }
            }
            _ => {}
        }
    }
}
