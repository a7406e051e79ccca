//! Context Assembler: cross-file facts for one error site.
//!
//! Given where an error happened and (optionally) which identifier is
//! missing, assembles a [`ContextBundle`] with:
//! 1. The failing file's content.
//! 2. Every definition of the missing name, with its defining file.
//! 3. Suggested import statements for those definitions.
//! 4. Near-miss names when nothing matches exactly.
//!
//! Duplicate definitions are all surfaced; choosing between them is left to
//! the caller.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::bundle::{keys, ContextBundle};
use super::fuzzy::close_matches;
use crate::error::{DiagnosticsError, DiagnosticsResult};
use crate::project::{module_name, scan, ProjectIndex, ScanConfig, SymbolEntry, SymbolKind};

/// Maximum near-miss names reported.
const MAX_CANDIDATES: usize = 3;
/// Minimum similarity for a near-miss name.
const CANDIDATE_CUTOFF: f64 = 0.6;

/// Description of an error site.
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    /// Path as it appears in the traceback (relative or absolute)
    pub error_file: String,
    pub error_line: Option<usize>,
    /// e.g. "NameError", "ImportError", "AttributeError"
    pub error_type: String,
    /// The identifier that could not be found
    pub undefined_name: Option<String>,
    /// Class or module owning a missing attribute (AttributeError)
    pub owner: Option<String>,
    /// Module named by an ImportError / ModuleNotFoundError
    pub module: Option<String>,
}

impl ContextQuery {
    pub fn new(error_file: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error_file: error_file.into(),
            error_type: error_type.into(),
            ..Self::default()
        }
    }

    pub fn line(mut self, line: usize) -> Self {
        self.error_line = Some(line);
        self
    }

    pub fn undefined_name(mut self, name: impl Into<String>) -> Self {
        self.undefined_name = Some(name.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }
}

/// Answers "where is X defined / how do I import it" for one project.
///
/// Owns its [`ProjectIndex`]; the index is read-only once built.
pub struct ContextAssembler {
    index: ProjectIndex,
}

impl ContextAssembler {
    pub fn new(index: ProjectIndex) -> Self {
        Self { index }
    }

    /// Scan `root` and build an assembler over it.
    pub fn from_root(root: impl AsRef<Path>, config: &ScanConfig) -> DiagnosticsResult<Self> {
        Ok(Self::new(scan(root, config)?))
    }

    pub fn index(&self) -> &ProjectIndex {
        &self.index
    }

    /// Assemble context for an error site.
    ///
    /// Returns [`DiagnosticsError::FileNotIndexed`] when `error_file` is not
    /// part of the index. A name with no definitions is not an error: the
    /// bundle simply has no matching symbols.
    pub fn get_context_for_error(
        &self,
        error_file: &str,
        error_line: Option<usize>,
        error_type: &str,
        undefined_name: Option<&str>,
    ) -> DiagnosticsResult<ContextBundle> {
        let mut query = ContextQuery::new(error_file, error_type);
        query.error_line = error_line;
        query.undefined_name = undefined_name.map(String::from);
        self.get_context(&query)
    }

    /// Assemble context from a full query (owner/module aware).
    pub fn get_context(&self, query: &ContextQuery) -> DiagnosticsResult<ContextBundle> {
        let rel = self
            .index
            .resolve_path(&query.error_file)
            .ok_or_else(|| DiagnosticsError::not_indexed(&query.error_file))?;
        let source = self
            .index
            .file(&rel)
            .ok_or_else(|| DiagnosticsError::not_indexed(&rel))?;

        let mut bundle = ContextBundle::new();
        bundle.insert(keys::ERROR_FILE_CONTENT, source.raw_text.clone());

        let mut related_files: BTreeSet<String> = BTreeSet::new();
        let mut symbols = Map::new();
        let mut suggestions: Vec<String> = Vec::new();
        let mut candidates: Vec<String> = Vec::new();

        match query.undefined_name.as_deref() {
            Some(name) => {
                let matches = self.index.lookup(name).entries();
                debug!(
                    file = %rel,
                    name,
                    matches = matches.len(),
                    "Looking up undefined name"
                );
                if !matches.is_empty() {
                    symbols.insert(name.to_string(), symbol_list(matches));
                }
                for entry in matches {
                    if entry.defining_file == rel {
                        continue;
                    }
                    related_files.insert(entry.defining_file.clone());
                    let suggestion = import_suggestion(&rel, &entry.defining_file, name);
                    if !suggestions.contains(&suggestion) {
                        suggestions.push(suggestion);
                    }
                }
                if matches.is_empty() {
                    candidates.extend(close_matches(
                        name,
                        self.index.symbols.names(),
                        MAX_CANDIDATES,
                        CANDIDATE_CUTOFF,
                    ));
                }
            }
            None => {
                related_files.extend(self.index.imports_of(&rel));
                related_files.extend(self.index.imported_by(&rel));
            }
        }

        // AttributeError: show the owning class, or the owning project module.
        if let Some(owner) = query.owner.as_deref() {
            let owner_matches = self.index.lookup(owner).entries();
            let classes: Vec<SymbolEntry> = owner_matches
                .iter()
                .filter(|e| e.kind == SymbolKind::Class)
                .cloned()
                .collect();
            if !classes.is_empty() {
                for class in &classes {
                    if class.defining_file != rel {
                        related_files.insert(class.defining_file.clone());
                    }
                }
                symbols.insert(owner.to_string(), symbol_list(&classes));
            } else if let Some(module_file) = self.module_file(owner) {
                if module_file != rel {
                    related_files.insert(module_file.clone());
                }
                if let Some(attr) = query.undefined_name.as_deref() {
                    let in_module: Vec<&str> = self
                        .index
                        .symbols
                        .in_file(&module_file)
                        .into_iter()
                        .map(|e| e.name.as_str())
                        .collect();
                    for c in close_matches(attr, in_module, MAX_CANDIDATES, CANDIDATE_CUTOFF) {
                        if !candidates.contains(&c) {
                            candidates.push(c);
                        }
                    }
                }
            }
        }

        // Import errors: unknown module paths and cycles.
        if is_import_error(&query.error_type) {
            if let Some(module) = query.module.as_deref() {
                match self.module_file(module) {
                    Some(file) => {
                        if file != rel {
                            related_files.insert(file);
                        }
                    }
                    None => {
                        let modules = self.index.module_names();
                        candidates.extend(close_matches(
                            module,
                            modules.iter().map(String::as_str),
                            MAX_CANDIDATES,
                            CANDIDATE_CUTOFF,
                        ));
                    }
                }
            }
            let cycles: Vec<Vec<String>> = self
                .index
                .find_circular_imports()
                .into_iter()
                .filter(|cycle| cycle.contains(&rel))
                .collect();
            if !cycles.is_empty() {
                for file in cycles.iter().flatten() {
                    if *file != rel {
                        related_files.insert(file.clone());
                    }
                }
                bundle.insert(keys::CIRCULAR_IMPORTS, json!(cycles));
            }
        }

        if query.undefined_name.is_some() || query.owner.is_some() {
            bundle.insert(keys::RELATED_SYMBOLS, Value::Object(symbols));
            bundle.insert(keys::IMPORT_SUGGESTIONS, json!(suggestions));
        }
        if !candidates.is_empty() {
            bundle.insert(keys::CANDIDATE_SYMBOLS, json!(candidates));
        }

        let mut files = Map::new();
        for file in &related_files {
            if let Some(src) = self.index.file(file) {
                files.insert(file.clone(), Value::String(src.raw_text.clone()));
            }
        }
        bundle.insert(keys::RELATED_FILES, Value::Object(files));

        Ok(bundle)
    }

    /// Project file for a dotted module name, if the module is local.
    fn module_file(&self, module: &str) -> Option<String> {
        let slashed = module.replace('.', "/");
        [format!("{slashed}.py"), format!("{slashed}/__init__.py")]
            .into_iter()
            .find(|c| self.index.file(c).is_some())
    }
}

fn is_import_error(error_type: &str) -> bool {
    matches!(error_type, "ImportError" | "ModuleNotFoundError")
}

fn symbol_list(entries: &[SymbolEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|e| {
                json!({
                    "file": e.defining_file,
                    "kind": e.kind,
                    "line": e.start_line,
                    "signature": e.signature_summary,
                    "definition": e.source_snippet,
                })
            })
            .collect(),
    )
}

/// Import statement that would bring `name` from `defining_file` into `error_file`.
///
/// Same directory: `from <stem> import name`. Otherwise the dotted module path
/// from the project root (`pkg/__init__.py` becomes `pkg`).
pub fn import_suggestion(error_file: &str, defining_file: &str, name: &str) -> String {
    let dir = |f: &str| f.rfind('/').map(|i| f[..i].to_string()).unwrap_or_default();
    let is_package_entry = defining_file.ends_with("__init__.py");

    if dir(error_file) == dir(defining_file) && !is_package_entry {
        let stem = defining_file
            .rsplit('/')
            .next()
            .unwrap_or(defining_file)
            .trim_end_matches(".py");
        format!("from {stem} import {name}")
    } else {
        format!("from {} import {}", module_name(defining_file), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, ContextAssembler) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let assembler = ContextAssembler::from_root(dir.path(), &ScanConfig::default()).unwrap();
        (dir, assembler)
    }

    #[test]
    fn test_undefined_name_suggests_import() {
        let (_dir, assembler) = project(&[
            ("main.py", "result = calculate(2, 3)\nprint(result)\n"),
            ("utils.py", "def calculate(a, b):\n    return a * b + 1\n"),
        ]);

        let bundle = assembler
            .get_context_for_error("main.py", Some(1), "NameError", Some("calculate"))
            .unwrap();

        assert_eq!(
            bundle.get(keys::IMPORT_SUGGESTIONS),
            Some(&json!(["from utils import calculate"]))
        );
        let files = bundle.get(keys::RELATED_FILES).unwrap();
        assert!(files.get("utils.py").is_some());
        let symbols = &bundle.get(keys::RELATED_SYMBOLS).unwrap()["calculate"];
        assert_eq!(symbols[0]["signature"], "def calculate(a, b)");
        assert_eq!(symbols[0]["kind"], "function");
    }

    #[test]
    fn test_duplicate_definitions_all_surface() {
        let (_dir, assembler) = project(&[
            ("app/main.py", "helper()\n"),
            ("app/tools.py", "def helper():\n    return 1\n"),
            ("lib/helpers.py", "def helper():\n    return 2\n"),
        ]);

        let bundle = assembler
            .get_context_for_error("app/main.py", None, "NameError", Some("helper"))
            .unwrap();

        let symbols = bundle.get(keys::RELATED_SYMBOLS).unwrap()["helper"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(symbols.len(), 2);
        assert_eq!(
            bundle.get(keys::IMPORT_SUGGESTIONS),
            Some(&json!([
                "from tools import helper",
                "from lib.helpers import helper"
            ]))
        );
    }

    #[test]
    fn test_missing_name_is_empty_not_error() {
        let (_dir, assembler) = project(&[
            ("main.py", "print(helllo)\n"),
            ("greet.py", "def hello():\n    return 'hi'\n"),
        ]);

        let bundle = assembler
            .get_context_for_error("main.py", Some(1), "NameError", Some("helllo"))
            .unwrap();

        assert_eq!(bundle.get(keys::RELATED_SYMBOLS), Some(&json!({})));
        assert_eq!(bundle.get(keys::IMPORT_SUGGESTIONS), Some(&json!([])));
        assert_eq!(bundle.get(keys::CANDIDATE_SYMBOLS), Some(&json!(["hello"])));
    }

    #[test]
    fn test_unknown_file_is_lookup_error() {
        let (_dir, assembler) = project(&[("main.py", "x = 1\n")]);
        let err = assembler
            .get_context_for_error("other.py", None, "NameError", Some("x"))
            .unwrap_err();
        assert!(matches!(err, DiagnosticsError::FileNotIndexed { .. }));
    }

    #[test]
    fn test_no_name_falls_back_to_neighbours() {
        let (_dir, assembler) = project(&[
            ("main.py", "import models\nprint(models.User().nme)\n"),
            ("models.py", "from base import Base\nclass User(Base):\n    name = 'u'\n"),
            ("base.py", "class Base:\n    pass\n"),
            ("unrelated.py", "x = 1\n"),
        ]);

        let bundle = assembler
            .get_context_for_error("models.py", None, "AttributeError", None)
            .unwrap();

        let files = bundle.get(keys::RELATED_FILES).unwrap().as_object().unwrap();
        let names: Vec<&String> = files.keys().collect();
        assert_eq!(names, vec!["base.py", "main.py"]);
        assert!(!bundle.contains_key(keys::IMPORT_SUGGESTIONS));
    }

    #[test]
    fn test_attribute_error_shows_owner_class() {
        let (_dir, assembler) = project(&[
            ("main.py", "from shapes import Circle\nCircle(1).areaa()\n"),
            (
                "shapes.py",
                "class Circle:\n    def __init__(self, r):\n        self.r = r\n\n    def area(self):\n        return 3.14 * self.r ** 2\n",
            ),
        ]);

        let query = ContextQuery::new("main.py", "AttributeError")
            .line(2)
            .undefined_name("areaa")
            .owner("Circle");
        let bundle = assembler.get_context(&query).unwrap();

        let circle = &bundle.get(keys::RELATED_SYMBOLS).unwrap()["Circle"][0];
        assert_eq!(circle["kind"], "class");
        assert!(bundle.get(keys::RELATED_FILES).unwrap()["shapes.py"].is_string());
    }

    #[test]
    fn test_import_error_reports_cycle_and_module_typos() {
        let (_dir, assembler) = project(&[
            ("a.py", "from b import g\ndef f():\n    return g()\n"),
            ("b.py", "from a import f\ndef g():\n    return 1\n"),
            ("main.py", "import utilz\n"),
            ("utils.py", "X = 1\n"),
        ]);

        let query = ContextQuery::new("a.py", "ImportError")
            .undefined_name("f")
            .module("a");
        let bundle = assembler.get_context(&query).unwrap();
        assert_eq!(
            bundle.get(keys::CIRCULAR_IMPORTS),
            Some(&json!([["a.py", "b.py"]]))
        );

        let query = ContextQuery::new("main.py", "ModuleNotFoundError").module("utilz");
        let bundle = assembler.get_context(&query).unwrap();
        assert_eq!(bundle.get(keys::CANDIDATE_SYMBOLS), Some(&json!(["utils"])));
    }

    #[test]
    fn test_import_suggestion_forms() {
        assert_eq!(
            import_suggestion("main.py", "utils.py", "calc"),
            "from utils import calc"
        );
        assert_eq!(
            import_suggestion("app/main.py", "app/helpers.py", "h"),
            "from helpers import h"
        );
        assert_eq!(
            import_suggestion("main.py", "pkg/sub/mod.py", "f"),
            "from pkg.sub.mod import f"
        );
        assert_eq!(
            import_suggestion("main.py", "pkg/__init__.py", "Thing"),
            "from pkg import Thing"
        );
    }
}
