//! Import Graph: per-file import statements resolved to project files.
//!
//! Edges are recorded per file first; `imported_by` is then computed as the
//! transpose of the resolved forward edges in a second pass. Rebuilding from
//! the same edges in any order yields the same graph.
//!
//! Imports that do not resolve to a project file are treated as external
//! (standard library or third-party) and stay out of the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use super::symbol_index::node_text;

/// Syntactic form of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    /// `import a.b` / `import a.b as c`
    ModuleImport,
    /// `from a.b import x` / `from . import x`
    FromImport,
}

/// One import as written in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEdge {
    /// Project-relative path of the importing file
    pub source_file: String,
    pub kind: ImportKind,
    /// Dotted module path without leading dots (may be empty for `from . import x`)
    pub module_path: String,
    /// Names pulled in by a `from` import (`*` for wildcard)
    #[serde(default)]
    pub imported_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub is_relative: bool,
    /// Number of leading dots for relative imports, 0 otherwise
    pub level: usize,
    /// 1-indexed line of the statement
    pub line: usize,
}

impl ImportEdge {
    /// Render the statement back into Python syntax (for prompts and logs).
    pub fn statement(&self) -> String {
        let module = format!("{}{}", ".".repeat(self.level), self.module_path);
        match self.kind {
            ImportKind::ModuleImport => match &self.alias {
                Some(alias) => format!("import {module} as {alias}"),
                None => format!("import {module}"),
            },
            ImportKind::FromImport => {
                format!("from {} import {}", module, self.imported_names.join(", "))
            }
        }
    }
}

/// An import edge together with the project files it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedImport {
    pub edge: ImportEdge,
    /// Empty for external modules
    pub targets: Vec<String>,
}

/// Forward and reverse import relations between project files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportGraph {
    resolved: Vec<ResolvedImport>,
    imports: BTreeMap<String, BTreeSet<String>>,
    imported_by: BTreeMap<String, BTreeSet<String>>,
}

impl ImportGraph {
    /// Build the graph from raw edges against the set of known project files.
    pub fn build(edges: impl IntoIterator<Item = ImportEdge>, files: &BTreeSet<String>) -> Self {
        // Pass 1: resolve every edge into forward relations.
        let mut resolved: Vec<ResolvedImport> = edges
            .into_iter()
            .map(|edge| {
                let targets = resolve_import(&edge, files);
                ResolvedImport { edge, targets }
            })
            .collect();
        resolved.sort_by(|a, b| {
            a.edge
                .source_file
                .cmp(&b.edge.source_file)
                .then(a.edge.line.cmp(&b.edge.line))
                .then(a.edge.module_path.cmp(&b.edge.module_path))
                .then(a.edge.imported_names.cmp(&b.edge.imported_names))
        });

        let mut imports: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for r in &resolved {
            if r.targets.is_empty() {
                continue;
            }
            imports
                .entry(r.edge.source_file.clone())
                .or_default()
                .extend(r.targets.iter().cloned());
        }

        // Pass 2: transpose.
        let mut imported_by: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (source, targets) in &imports {
            for target in targets {
                imported_by
                    .entry(target.clone())
                    .or_default()
                    .insert(source.clone());
            }
        }

        Self {
            resolved,
            imports,
            imported_by,
        }
    }

    /// Every recorded import, resolved or not, ordered by file then line.
    pub fn edges(&self) -> &[ResolvedImport] {
        &self.resolved
    }

    /// Recorded imports of one file.
    pub fn edges_from<'a>(&'a self, file: &'a str) -> impl Iterator<Item = &'a ResolvedImport> {
        self.resolved
            .iter()
            .filter(move |r| r.edge.source_file == file)
    }

    /// Project files that `file` imports.
    pub fn imports(&self, file: &str) -> BTreeSet<String> {
        self.imports.get(file).cloned().unwrap_or_default()
    }

    /// Project files that import `file`.
    pub fn imported_by(&self, file: &str) -> BTreeSet<String> {
        self.imported_by.get(file).cloned().unwrap_or_default()
    }

    /// Number of resolved file-to-file relations.
    pub fn resolved_edge_count(&self) -> usize {
        self.imports.values().map(BTreeSet::len).sum()
    }

    /// Files reachable from `file` along forward edges, up to `max_depth` hops.
    pub fn related_files(&self, file: &str, max_depth: usize) -> Vec<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        let mut order = Vec::new();
        seen.insert(file.to_string());
        queue.push_back((file.to_string(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            if let Some(targets) = self.imports.get(&current) {
                for target in targets {
                    if seen.insert(target.clone()) {
                        order.push(target.clone());
                        queue.push_back((target.clone(), depth + 1));
                    }
                }
            }
        }

        order
    }

    /// Groups of files that import each other, directly or transitively.
    ///
    /// Each cycle is sorted; the list of cycles is sorted by first member.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for (source, targets) in &self.imports {
            for file in std::iter::once(source).chain(targets.iter()) {
                if !nodes.contains_key(file.as_str()) {
                    let idx = graph.add_node(file.clone());
                    nodes.insert(file.as_str(), idx);
                }
            }
        }
        for (source, targets) in &self.imports {
            let from = nodes[source.as_str()];
            for target in targets {
                graph.add_edge(from, nodes[target.as_str()], ());
            }
        }

        let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || graph.contains_edge(component[0], component[0])
            })
            .map(|component| {
                let mut files: Vec<String> =
                    component.into_iter().map(|idx| graph[idx].clone()).collect();
                files.sort();
                files
            })
            .collect();
        cycles.sort();
        cycles
    }
}

// ── Resolution ───────────────────────────────────────────────────────────────

/// Resolve an import to project files. Returns an empty list for external modules.
///
/// Order: relative imports resolve against the importing file's package
/// (walked up `level - 1` directories); absolute imports try `<root>/a/b.py`,
/// `<root>/a/b/__init__.py`, then the same two next to the importing file.
/// A `from` import of a package also picks up imported names that are
/// submodules of it.
pub fn resolve_import(edge: &ImportEdge, files: &BTreeSet<String>) -> Vec<String> {
    let source_dir = parent_dir(&edge.source_file);
    let mut targets: Vec<String> = Vec::new();

    let primary = if edge.is_relative {
        let Some(base) = ancestor(source_dir, edge.level.saturating_sub(1)) else {
            return targets;
        };
        if edge.module_path.is_empty() {
            let init = join(&base, "__init__.py");
            files.contains(&init).then_some(init)
        } else {
            module_candidates(&base, &edge.module_path)
                .into_iter()
                .find(|c| files.contains(c))
        }
    } else {
        module_candidates("", &edge.module_path)
            .into_iter()
            .chain(if source_dir.is_empty() {
                Vec::new()
            } else {
                module_candidates(source_dir, &edge.module_path).to_vec()
            })
            .find(|c| files.contains(c))
    };

    if let Some(primary) = &primary {
        targets.push(primary.clone());
    }

    if edge.kind == ImportKind::FromImport {
        // Names may be submodules of the imported package.
        let package_dir = match &primary {
            Some(p) if p.ends_with("__init__.py") => Some(parent_dir(p).to_string()),
            None if edge.is_relative && edge.module_path.is_empty() => {
                ancestor(source_dir, edge.level.saturating_sub(1))
            }
            _ => None,
        };
        if let Some(dir) = package_dir {
            for name in edge.imported_names.iter().filter(|n| n.as_str() != "*") {
                if let Some(sub) = module_candidates(&dir, name)
                    .into_iter()
                    .find(|c| files.contains(c))
                {
                    if !targets.contains(&sub) {
                        targets.push(sub);
                    }
                }
            }
        }
    }

    targets
}

fn module_candidates(base: &str, dotted: &str) -> [String; 2] {
    let slashed = dotted.replace('.', "/");
    [
        join(base, &format!("{slashed}.py")),
        join(base, &format!("{slashed}/__init__.py")),
    ]
}

fn parent_dir(file: &str) -> &str {
    match file.rfind('/') {
        Some(idx) => &file[..idx],
        None => "",
    }
}

/// Walk `levels` directories up from `dir`. `None` if that leaves the project.
fn ancestor(dir: &str, levels: usize) -> Option<String> {
    let mut current = dir.to_string();
    for _ in 0..levels {
        if current.is_empty() {
            return None;
        }
        current = parent_dir(&current).to_string();
    }
    Some(current)
}

fn join(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{base}/{rel}")
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Collect every import statement in a parsed module, at any nesting depth.
pub(crate) fn extract_imports(root: Node, source: &[u8], file: &str) -> Vec<ImportEdge> {
    let mut edges = Vec::new();
    walk_imports(root, source, file, &mut edges);
    edges
}

fn walk_imports(node: Node, source: &[u8], file: &str, edges: &mut Vec<ImportEdge>) {
    match node.kind() {
        "import_statement" => {
            let line = node.start_position().row + 1;
            let mut cursor = node.walk();
            for name in node.children_by_field_name("name", &mut cursor) {
                let (module, alias) = split_alias(name, source);
                if let Some(module) = module {
                    edges.push(ImportEdge {
                        source_file: file.to_string(),
                        kind: ImportKind::ModuleImport,
                        module_path: module,
                        imported_names: Vec::new(),
                        alias,
                        is_relative: false,
                        level: 0,
                        line,
                    });
                }
            }
            return;
        }
        "import_from_statement" | "future_import_statement" => {
            if let Some(edge) = from_import(node, source, file) {
                edges.push(edge);
            }
            return;
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        walk_imports(child, source, file, edges);
    }
}

fn from_import(node: Node, source: &[u8], file: &str) -> Option<ImportEdge> {
    let (module_path, level) = if node.kind() == "future_import_statement" {
        ("__future__".to_string(), 0)
    } else {
        let module = node.child_by_field_name("module_name")?;
        if module.kind() == "relative_import" {
            let mut level = 0;
            let mut path = String::new();
            let mut cursor = module.walk();
            for part in module.named_children(&mut cursor) {
                match part.kind() {
                    "import_prefix" => {
                        level = node_text(part, source)
                            .map(|t| t.chars().filter(|c| *c == '.').count())
                            .unwrap_or(0);
                    }
                    "dotted_name" => {
                        path = node_text(part, source).unwrap_or_default().to_string();
                    }
                    _ => {}
                }
            }
            (path, level)
        } else {
            (node_text(module, source)?.to_string(), 0)
        }
    };

    let mut imported_names = Vec::new();
    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        if let (Some(name), _) = split_alias(name, source) {
            imported_names.push(name);
        }
    }
    let mut cursor = node.walk();
    if node
        .named_children(&mut cursor)
        .any(|c| c.kind() == "wildcard_import")
    {
        imported_names.push("*".to_string());
    }

    Some(ImportEdge {
        source_file: file.to_string(),
        kind: ImportKind::FromImport,
        module_path,
        imported_names,
        alias: None,
        is_relative: level > 0,
        level,
        line: node.start_position().row + 1,
    })
}

/// `a.b` → (a.b, None); `a.b as c` → (a.b, Some(c))
fn split_alias(node: Node, source: &[u8]) -> (Option<String>, Option<String>) {
    if node.kind() == "aliased_import" {
        let name = node
            .child_by_field_name("name")
            .and_then(|n| node_text(n, source))
            .map(String::from);
        let alias = node
            .child_by_field_name("alias")
            .and_then(|n| node_text(n, source))
            .map(String::from);
        (name, alias)
    } else {
        (node_text(node, source).map(String::from), None)
    }
}
