//! Context bundle: an insertion-ordered map of semantic keys to JSON values.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// Well-known bundle keys.
pub mod keys {
    pub const ERROR_FILE_CONTENT: &str = "error_file_content";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const RELATED_SYMBOLS: &str = "related_symbols";
    pub const IMPORT_SUGGESTIONS: &str = "import_suggestions";
    pub const CANDIDATE_SYMBOLS: &str = "candidate_symbols";
    pub const CIRCULAR_IMPORTS: &str = "circular_imports";
    pub const RAG_SOLUTIONS: &str = "rag_solutions";
    pub const RELATED_FILES: &str = "related_files";
}

/// Keyed collection of facts assembled for one repair attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextBundle {
    entries: Vec<(String, Value)>,
}

impl ContextBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key. Replacing keeps the key's original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as prompt text, one `### key` section per entry in order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            if is_empty_value(value) {
                continue;
            }
            out.push_str("### ");
            out.push_str(key);
            out.push('\n');
            match value {
                Value::String(s) => out.push_str(s),
                Value::Object(map) if map.values().all(Value::is_string) => {
                    // path -> content maps read better as fenced blocks
                    for (name, content) in map {
                        out.push_str(&format!(
                            "# {name}\n```\n{}\n```\n",
                            content.as_str().unwrap_or_default()
                        ));
                    }
                }
                Value::Array(items) if items.iter().all(Value::is_string) => {
                    for item in items {
                        out.push_str("- ");
                        out.push_str(item.as_str().unwrap_or_default());
                        out.push('\n');
                    }
                }
                other => out.push_str(
                    &serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
                ),
            }
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

impl Serialize for ContextBundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl FromIterator<(String, Value)> for ContextBundle {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut bundle = Self::new();
        for (k, v) in iter {
            bundle.insert(k, v);
        }
        bundle
    }
}
