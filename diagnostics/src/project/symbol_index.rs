//! Symbol Index: module-level function and class definitions across a project.
//!
//! Names map to a *list* of definitions. Two files defining `helper` is a
//! legitimate situation, and lookups surface every candidate instead of
//! letting the last file scanned win.
//!
//! Only module-level definitions are indexed. Methods are recorded on their
//! class entry, nested functions are not indexed at all.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

/// Categories of indexed Python symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Class,
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function => write!(f, "function"),
            Self::Class => write!(f, "class"),
        }
    }
}

/// A module-level definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// Symbol name (e.g., "calculate", "Config")
    pub name: String,
    pub kind: SymbolKind,
    /// Project-relative path with `/` separators
    pub defining_file: String,
    /// First line of the definition (1-indexed, decorators included)
    pub start_line: usize,
    /// Last line of the definition (1-indexed)
    pub end_line: usize,
    /// `def name(a, b) -> T` or `class Name(Base)`
    pub signature_summary: String,
    /// Full source text of the definition
    pub source_snippet: String,
    /// Method names, for classes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

/// Result of looking a name up in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Missing,
    Single(&'a SymbolEntry),
    Multiple(&'a [SymbolEntry]),
}

impl<'a> Lookup<'a> {
    /// All matching entries, regardless of how many there are.
    pub fn entries(&self) -> &'a [SymbolEntry] {
        match *self {
            Self::Missing => &[],
            Self::Single(entry) => std::slice::from_ref(entry),
            Self::Multiple(entries) => entries,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Cross-file table of module-level definitions.
#[derive(Debug, Clone, Default)]
pub struct SymbolIndex {
    table: HashMap<String, Vec<SymbolEntry>>,
    count: usize,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. Existing definitions with the same name are kept.
    pub fn insert(&mut self, entry: SymbolEntry) {
        let bucket = self.table.entry(entry.name.clone()).or_default();
        bucket.push(entry);
        bucket.sort_by(|a, b| {
            a.defining_file
                .cmp(&b.defining_file)
                .then(a.start_line.cmp(&b.start_line))
        });
        self.count += 1;
    }

    pub fn lookup(&self, name: &str) -> Lookup<'_> {
        match self.table.get(name).map(Vec::as_slice) {
            None | Some([]) => Lookup::Missing,
            Some([single]) => Lookup::Single(single),
            Some(all) => Lookup::Multiple(all),
        }
    }

    /// Definitions located in one file, ordered by line.
    pub fn in_file(&self, file: &str) -> Vec<&SymbolEntry> {
        let mut found: Vec<&SymbolEntry> = self
            .table
            .values()
            .flatten()
            .filter(|e| e.defining_file == file)
            .collect();
        found.sort_by_key(|e| e.start_line);
        found
    }

    /// Every distinct name, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Total number of definitions (not distinct names).
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Extract module-level definitions from a parsed Python module.
pub(crate) fn extract_symbols(root: Node, source: &[u8], file: &str) -> Vec<SymbolEntry> {
    let mut symbols = Vec::new();
    let mut cursor = root.walk();

    for child in root.named_children(&mut cursor) {
        let (outer, definition) = match child.kind() {
            "function_definition" | "class_definition" => (child, child),
            "decorated_definition" => match child.child_by_field_name("definition") {
                Some(def) => (child, def),
                None => continue,
            },
            _ => continue,
        };

        let entry = match definition.kind() {
            "function_definition" => extract_function(outer, definition, source, file),
            "class_definition" => extract_class(outer, definition, source, file),
            _ => None,
        };
        if let Some(entry) = entry {
            symbols.push(entry);
        }
    }

    symbols
}

fn extract_function(outer: Node, def: Node, source: &[u8], file: &str) -> Option<SymbolEntry> {
    let name = node_text(def.child_by_field_name("name")?, source)?;
    let params = def
        .child_by_field_name("parameters")
        .and_then(|p| node_text(p, source))
        .map(collapse_whitespace)
        .unwrap_or_else(|| "()".to_string());
    let is_async = def
        .child(0)
        .map(|first| first.kind() == "async")
        .unwrap_or(false);

    let mut signature = format!(
        "{}def {}{}",
        if is_async { "async " } else { "" },
        name,
        params
    );
    if let Some(ret) = def
        .child_by_field_name("return_type")
        .and_then(|r| node_text(r, source))
    {
        signature.push_str(" -> ");
        signature.push_str(ret);
    }

    Some(SymbolEntry {
        name: name.to_string(),
        kind: SymbolKind::Function,
        defining_file: file.to_string(),
        start_line: outer.start_position().row + 1,
        end_line: outer.end_position().row + 1,
        signature_summary: signature,
        source_snippet: node_text(outer, source)?.to_string(),
        methods: Vec::new(),
    })
}

fn extract_class(outer: Node, def: Node, source: &[u8], file: &str) -> Option<SymbolEntry> {
    let name = node_text(def.child_by_field_name("name")?, source)?;
    let bases = def
        .child_by_field_name("superclasses")
        .and_then(|b| node_text(b, source))
        .map(collapse_whitespace)
        .unwrap_or_default();

    let mut methods = Vec::new();
    if let Some(body) = def.child_by_field_name("body") {
        let mut cursor = body.walk();
        for stmt in body.named_children(&mut cursor) {
            let func = match stmt.kind() {
                "function_definition" => Some(stmt),
                "decorated_definition" => stmt
                    .child_by_field_name("definition")
                    .filter(|d| d.kind() == "function_definition"),
                _ => None,
            };
            if let Some(method_name) = func
                .and_then(|f| f.child_by_field_name("name"))
                .and_then(|n| node_text(n, source))
            {
                methods.push(method_name.to_string());
            }
        }
    }

    Some(SymbolEntry {
        name: name.to_string(),
        kind: SymbolKind::Class,
        defining_file: file.to_string(),
        start_line: outer.start_position().row + 1,
        end_line: outer.end_position().row + 1,
        signature_summary: format!("class {name}{bases}"),
        source_snippet: node_text(outer, source)?.to_string(),
        methods,
    })
}

pub(crate) fn node_text<'s>(node: Node, source: &'s [u8]) -> Option<&'s str> {
    node.utf8_text(source).ok()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::parser::{parse_module, python_parser};

    fn entry(name: &str, file: &str, line: usize) -> SymbolEntry {
        SymbolEntry {
            name: name.to_string(),
            kind: SymbolKind::Function,
            defining_file: file.to_string(),
            start_line: line,
            end_line: line,
            signature_summary: format!("def {name}()"),
            source_snippet: format!("def {name}():\n    pass"),
            methods: Vec::new(),
        }
    }

    #[test]
    fn test_duplicate_names_are_kept() {
        let mut index = SymbolIndex::new();
        index.insert(entry("helper", "b.py", 1));
        index.insert(entry("helper", "a.py", 3));
        index.insert(entry("solo", "a.py", 9));

        match index.lookup("helper") {
            Lookup::Multiple(all) => {
                assert_eq!(all.len(), 2);
                assert_eq!(all[0].defining_file, "a.py");
                assert_eq!(all[1].defining_file, "b.py");
            }
            other => panic!("expected Multiple, got {other:?}"),
        }
        assert!(matches!(index.lookup("solo"), Lookup::Single(e) if e.start_line == 9));
        assert!(index.lookup("nope").is_missing());
        assert_eq!(index.len(), 3);
        assert_eq!(index.names(), vec!["helper", "solo"]);
    }

    #[test]
    fn test_extracts_module_level_definitions_only() {
        let source = r#"
import os

def top(a, b=2):
    def inner():
        pass
    return inner

async def fetch(url: str) -> bytes:
    return b""

@decorator
def decorated():
    pass

class Shape(Base, metaclass=Meta):
    def area(self):
        return 0

    @property
    def name(self):
        return "shape"

if True:
    def conditional():
        pass
"#;
        let parsed = parse_module(&mut python_parser().unwrap(), "shapes.py", source);
        assert!(parsed.parse_error.is_none());

        let names: Vec<&str> = parsed.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["top", "fetch", "decorated", "Shape"]);

        let top = &parsed.symbols[0];
        assert_eq!(top.signature_summary, "def top(a, b=2)");
        assert_eq!(top.start_line, 4);

        let fetch = &parsed.symbols[1];
        assert_eq!(fetch.signature_summary, "async def fetch(url: str) -> bytes");

        let decorated = &parsed.symbols[2];
        assert!(decorated.source_snippet.starts_with("@decorator"));
        assert_eq!(decorated.start_line, 12);

        let shape = &parsed.symbols[3];
        assert_eq!(shape.kind, SymbolKind::Class);
        assert_eq!(shape.signature_summary, "class Shape(Base, metaclass=Meta)");
        assert_eq!(shape.methods, vec!["area", "name"]);
    }

    #[test]
    fn test_in_file_orders_by_line() {
        let mut index = SymbolIndex::new();
        index.insert(entry("late", "m.py", 20));
        index.insert(entry("early", "m.py", 2));
        index.insert(entry("other", "n.py", 1));

        let names: Vec<&str> = index.in_file("m.py").iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }
}
