use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Immutable snapshot of one cached usage session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Auxiliary fields carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project: String::new(),
            date: String::new(),
            messages: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Build a record from a raw cache object. `id` wins over any `id` field inside `fields`.
    pub fn from_fields(id: impl Into<String>, fields: &Map<String, Value>) -> Self {
        let mut record = Self::new(id);
        for (key, value) in fields {
            match key.as_str() {
                "id" => {}
                "project" => record.project = label(value),
                "date" => record.date = label(value),
                "messages" => {
                    if let Value::Array(items) = value {
                        record.messages = items.clone();
                    }
                }
                _ => {
                    record.extra.insert(key.clone(), value.clone());
                }
            }
        }
        record
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Short listing row: truncated id and project plus the message count.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.chars().take(8).collect(),
            project: self.project.chars().take(16).collect(),
            date: self.date.clone(),
            messages: self.message_count(),
        }
    }

    /// Prefix-or-substring match used by single-session lookups.
    pub fn matches(&self, needle: &str) -> bool {
        !needle.is_empty() && (self.id.starts_with(needle) || self.id.contains(needle))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub project: String,
    pub date: String,
    pub messages: usize,
}

fn label(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalize the external session cache into an ordered list of records.
///
/// Two shapes are accepted: a mapping of `id -> record`, or an object whose
/// `sessions` key holds a list of records each carrying its own `id`. A bare
/// list is treated like the second shape. Entries that are not objects, and
/// list entries without an `id`, are skipped.
pub fn normalize_cache(cache: &Value) -> Vec<SessionRecord> {
    match cache {
        Value::Object(map) => match map.get("sessions") {
            Some(Value::Array(items)) => from_list(items),
            _ => map
                .iter()
                .filter_map(|(id, value)| match value {
                    Value::Object(fields) => Some(SessionRecord::from_fields(id.clone(), fields)),
                    _ => None,
                })
                .collect(),
        },
        Value::Array(items) => from_list(items),
        _ => Vec::new(),
    }
}

fn from_list(items: &[Value]) -> Vec<SessionRecord> {
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Value::Object(fields) = item else {
            warn!(index, "skipping non-object session entry");
            continue;
        };
        let id = match fields.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                warn!(index, "skipping session entry without id");
                continue;
            }
        };
        records.push(SessionRecord::from_fields(id, fields));
    }
    records
}
