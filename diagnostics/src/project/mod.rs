//! Project scan: symbol table and import graph for one project root.
//!
//! `scan()` walks the tree once and returns an owned [`ProjectIndex`]. There
//! is no process-wide cache: each debugging session builds its own index and
//! rebuilds it (rather than mutating it) if the project changes.

pub mod file_walker;
pub mod import_graph;
pub mod parser;
pub mod symbol_index;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DiagnosticsError, DiagnosticsResult};
pub use file_walker::{FileWalker, ScanConfig};
pub use import_graph::{ImportEdge, ImportGraph, ImportKind, ResolvedImport};
pub use parser::{parse_module, python_parser, ParseError, ParsedModule};
pub use symbol_index::{Lookup, SymbolEntry, SymbolIndex, SymbolKind};

/// Depth used when collecting files reachable through imports.
pub const RELATED_FILES_DEPTH: usize = 3;

/// A scanned source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Project-relative path with `/` separators
    pub relative_path: String,
    pub raw_text: String,
}

/// Counters and soft failures collected during a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub files_skipped_size: usize,
    pub symbols_indexed: usize,
    pub imports_recorded: usize,
    pub resolved_edges: usize,
    pub parse_errors: Vec<ParseError>,
    pub duration_ms: u64,
}

/// Symbol table, import graph and file contents for one project root.
#[derive(Debug, Clone)]
pub struct ProjectIndex {
    root: PathBuf,
    files: BTreeMap<String, SourceFile>,
    pub symbols: SymbolIndex,
    pub graph: ImportGraph,
    pub stats: ScanStats,
}

/// Scan a project root.
///
/// Fails when `root` is not an existing directory or the Python grammar cannot
/// be loaded. Unreadable and unparsable files are logged, recorded in
/// [`ScanStats`], and skipped.
pub fn scan(root: impl AsRef<Path>, config: &ScanConfig) -> DiagnosticsResult<ProjectIndex> {
    let root = root.as_ref();
    if !root.exists() {
        return Err(DiagnosticsError::invalid_root(root, "does not exist"));
    }
    if !root.is_dir() {
        return Err(DiagnosticsError::invalid_root(root, "not a directory"));
    }
    let root = root
        .canonicalize()
        .map_err(|e| DiagnosticsError::io(root, e))?;

    let mut parser = python_parser()?;
    let start = Instant::now();
    let walk = FileWalker::new(&root, config.clone()).python_files();

    let mut stats = ScanStats {
        files_skipped_size: walk.oversized.len(),
        ..ScanStats::default()
    };
    let mut files = BTreeMap::new();
    let mut symbols = SymbolIndex::new();
    let mut edges = Vec::new();

    for path in &walk.files {
        let rel = relative_path(&root, path);
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(file = %rel, error = %e, "Failed to read source file");
                stats.parse_errors.push(ParseError {
                    file: rel,
                    line: None,
                    message: format!("unreadable: {e}"),
                });
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let parsed = parse_module(&mut parser, &rel, &text);
        stats.files_scanned += 1;
        if let Some(err) = parsed.parse_error {
            warn!(
                file = %err.file,
                line = ?err.line,
                message = %err.message,
                "Skipping file with syntax errors"
            );
            stats.parse_errors.push(err);
        }
        stats.symbols_indexed += parsed.symbols.len();
        stats.imports_recorded += parsed.imports.len();
        for symbol in parsed.symbols {
            symbols.insert(symbol);
        }
        edges.extend(parsed.imports);

        files.insert(
            rel.clone(),
            SourceFile {
                relative_path: rel,
                raw_text: text,
            },
        );
    }

    let known: BTreeSet<String> = files.keys().cloned().collect();
    let graph = ImportGraph::build(edges, &known);
    stats.resolved_edges = graph.resolved_edge_count();
    stats.duration_ms = start.elapsed().as_millis() as u64;

    info!(
        root = %root.display(),
        files = stats.files_scanned,
        symbols = stats.symbols_indexed,
        imports = stats.imports_recorded,
        resolved = stats.resolved_edges,
        parse_errors = stats.parse_errors.len(),
        duration_ms = stats.duration_ms,
        "Project scan complete"
    );

    Ok(ProjectIndex {
        root,
        files,
        symbols,
        graph,
        stats,
    })
}

impl ProjectIndex {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Split into the three scan products.
    pub fn into_parts(self) -> (SymbolIndex, ImportGraph, ScanStats) {
        (self.symbols, self.graph, self.stats)
    }

    pub fn lookup(&self, name: &str) -> Lookup<'_> {
        self.symbols.lookup(name)
    }

    /// A scanned file by project-relative path.
    pub fn file(&self, relative: &str) -> Option<&SourceFile> {
        self.files.get(relative)
    }

    pub fn files(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.values()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Map a path as it appears in a traceback onto an indexed file.
    ///
    /// Accepts project-relative paths and absolute paths under the root. As a
    /// last resort it matches on path tails, since tracebacks from a sandbox
    /// carry a different prefix: among indexed files whose path is a suffix of
    /// `path` (on a `/` boundary), the longest one wins.
    pub fn resolve_path(&self, path: &str) -> Option<String> {
        let normalized = path.replace('\\', "/");
        let trimmed = normalized.trim_start_matches("./");
        if self.files.contains_key(trimmed) {
            return Some(trimmed.to_string());
        }

        let as_path = Path::new(path);
        if as_path.is_absolute() {
            if let Ok(stripped) = as_path.strip_prefix(&self.root) {
                let rel = stripped.to_string_lossy().replace('\\', "/");
                if self.files.contains_key(&rel) {
                    return Some(rel);
                }
            }
        }

        self.files
            .keys()
            .filter(|rel| {
                normalized == **rel || normalized.ends_with(&format!("/{rel}"))
            })
            .max_by_key(|rel| rel.len())
            .cloned()
    }

    pub fn imports_of(&self, file: &str) -> BTreeSet<String> {
        self.graph.imports(file)
    }

    pub fn imported_by(&self, file: &str) -> BTreeSet<String> {
        self.graph.imported_by(file)
    }

    /// Files reachable through imports, nearest first.
    pub fn related_files(&self, file: &str, max_depth: usize) -> Vec<String> {
        self.graph.related_files(file, max_depth)
    }

    pub fn find_circular_imports(&self) -> Vec<Vec<String>> {
        self.graph.cycles()
    }

    /// Every indexed symbol name, sorted.
    pub fn symbol_names(&self) -> Vec<&str> {
        self.symbols.names()
    }

    /// Dotted module names of every indexed file (`pkg/__init__.py` → `pkg`).
    pub fn module_names(&self) -> Vec<String> {
        self.files.keys().map(|rel| module_name(rel)).collect()
    }
}

/// Dotted module name for a project-relative path.
pub fn module_name(relative: &str) -> String {
    let trimmed = relative.trim_end_matches(".py");
    let trimmed = trimmed.strip_suffix("/__init__").unwrap_or(trimmed);
    trimmed.replace('/', ".")
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_scan_rejects_missing_root() {
        let err = scan("/definitely/not/here", &ScanConfig::default()).unwrap_err();
        assert!(matches!(err, DiagnosticsError::InvalidProjectRoot { .. }));
    }

    #[test]
    fn test_scan_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.py", "x = 1");
        let err = scan(dir.path().join("main.py"), &ScanConfig::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_scan_continues_past_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good.py", "def good():\n    return 1\n");
        write(dir.path(), "bad.py", "def bad(:\n");
        write(dir.path(), "user.py", "from good import good\n");

        let index = scan(dir.path(), &ScanConfig::default()).unwrap();
        assert_eq!(index.stats.files_scanned, 3);
        assert_eq!(index.stats.parse_errors.len(), 1);
        assert_eq!(index.stats.parse_errors[0].file, "bad.py");
        assert!(matches!(index.lookup("good"), Lookup::Single(_)));
        // Content of the unparsable file is still available.
        assert!(index.file("bad.py").is_some());
        assert_eq!(
            index.imported_by("good.py").into_iter().collect::<Vec<_>>(),
            vec!["user.py"]
        );
    }

    #[test]
    fn test_resolve_path_variants() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkg/mod.py", "x = 1");
        write(dir.path(), "mod.py", "y = 2");
        let index = scan(dir.path(), &ScanConfig::default()).unwrap();

        assert_eq!(index.resolve_path("pkg/mod.py").as_deref(), Some("pkg/mod.py"));
        assert_eq!(index.resolve_path("./mod.py").as_deref(), Some("mod.py"));
        let abs = index.root().join("pkg/mod.py");
        assert_eq!(
            index.resolve_path(&abs.to_string_lossy()).as_deref(),
            Some("pkg/mod.py")
        );
        assert_eq!(
            index.resolve_path("/tmp/sandbox-123/pkg/mod.py").as_deref(),
            Some("pkg/mod.py")
        );
        assert_eq!(index.resolve_path("elsewhere.py"), None);
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("utils.py"), "utils");
        assert_eq!(module_name("pkg/sub/mod.py"), "pkg.sub.mod");
        assert_eq!(module_name("pkg/__init__.py"), "pkg");
    }
}
