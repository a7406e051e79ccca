//! Tree-sitter front end shared by the symbol and import extractors.

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser};

use crate::error::{DiagnosticsError, DiagnosticsResult};

use super::import_graph::{extract_imports, ImportEdge};
use super::symbol_index::{extract_symbols, SymbolEntry};

/// A file that could not be parsed cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub file: String,
    /// 1-indexed line of the first syntax error, when known
    pub line: Option<usize>,
    pub message: String,
}

/// Everything extracted from one source file.
#[derive(Debug, Clone, Default)]
pub struct ParsedModule {
    pub symbols: Vec<SymbolEntry>,
    pub imports: Vec<ImportEdge>,
    pub parse_error: Option<ParseError>,
}

/// A parser loaded with the Python grammar.
///
/// Fails with [`DiagnosticsError::InvalidConfig`] when the linked grammar's
/// ABI is not one this tree-sitter runtime accepts. That is a build fault,
/// never a property of any one file.
pub fn python_parser() -> DiagnosticsResult<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| DiagnosticsError::config(format!("Python grammar unavailable: {e}")))?;
    Ok(parser)
}

/// Parse a Python source file and extract symbols and imports.
///
/// A file with syntax errors yields no symbols or imports, only a
/// `parse_error`. Half-parsed trees would index whatever the error recovery
/// happened to produce.
pub fn parse_module(parser: &mut Parser, file: &str, source: &str) -> ParsedModule {
    let Some(tree) = parser.parse(source, None) else {
        return ParsedModule {
            parse_error: Some(ParseError {
                file: file.to_string(),
                line: None,
                message: "parser produced no tree".to_string(),
            }),
            ..ParsedModule::default()
        };
    };

    let root = tree.root_node();
    if root.has_error() {
        let (line, message) = match first_error(root) {
            Some(node) if node.is_missing() => (
                Some(node.start_position().row + 1),
                format!("missing `{}`", node.kind()),
            ),
            Some(node) => (
                Some(node.start_position().row + 1),
                "invalid syntax".to_string(),
            ),
            None => (None, "invalid syntax".to_string()),
        };
        return ParsedModule {
            parse_error: Some(ParseError {
                file: file.to_string(),
                line,
                message,
            }),
            ..ParsedModule::default()
        };
    }

    let bytes = source.as_bytes();
    ParsedModule {
        symbols: extract_symbols(root, bytes, file),
        imports: extract_imports(root, bytes, file),
        parse_error: None,
    }
}

/// Depth-first search for the first ERROR or MISSING node.
fn first_error(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(file: &str, source: &str) -> ParsedModule {
        parse_module(&mut python_parser().unwrap(), file, source)
    }

    #[test]
    fn test_grammar_loads() {
        let parser = python_parser().unwrap();
        assert!(parser.language().is_some());
    }

    #[test]
    fn test_syntax_error_reported_with_line() {
        let source = "def ok():\n    return 1\n\ndef broken(:\n    pass\n";
        let parsed = parse("bad.py", source);
        let err = parsed.parse_error.expect("syntax error expected");
        assert_eq!(err.file, "bad.py");
        assert!(err.line.is_some());
        assert!(parsed.symbols.is_empty());
        assert!(parsed.imports.is_empty());
    }

    #[test]
    fn test_clean_module() {
        let parsed = parse("ok.py", "import os\n\ndef f():\n    return os.sep\n");
        assert!(parsed.parse_error.is_none());
        assert_eq!(parsed.symbols.len(), 1);
        assert_eq!(parsed.imports.len(), 1);
    }

    #[test]
    fn test_empty_module() {
        let parsed = parse("empty.py", "");
        assert!(parsed.parse_error.is_none());
        assert!(parsed.symbols.is_empty());
    }

    #[test]
    fn test_parser_reused_across_files() {
        let mut parser = python_parser().unwrap();
        let first = parse_module(&mut parser, "a.py", "def a():\n    pass\n");
        let second = parse_module(&mut parser, "b.py", "class B:\n    pass\n");
        assert_eq!(first.symbols[0].name, "a");
        assert_eq!(second.symbols[0].name, "B");
        assert_eq!(second.symbols[0].defining_file, "b.py");
    }
}
