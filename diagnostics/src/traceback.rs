//! Traceback parser: error type, location and missing identifier.
//!
//! Parses a Python failure report (usually a traceback) into a [`Diagnosis`]:
//! the final exception line, the innermost frame, and the identifier the
//! error is about, extracted with one pattern rule per error kind.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::context::ContextQuery;

static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File\s+"([^"]+)",\s+line\s+(\d+)(?:,\s+in\s+(\S+))?"#).unwrap()
});

static EXCEPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:[A-Za-z_][\w]*\.)*[A-Za-z_]\w*(?:Error|Exception|Warning))(?::\s*(.*))?$")
        .unwrap()
});

static NAME_NOT_DEFINED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"name '(\w+)' is not defined").unwrap());

static CANNOT_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cannot import name '(\w+)' from '([\w.]+)'").unwrap());

static NO_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"No module named '([\w.]+)'").unwrap());

static MODULE_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"module '([\w.]+)' has no attribute '(\w+)'").unwrap());

static OBJECT_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:type object )?'(\w+)'(?: object)? has no attribute '(\w+)'").unwrap()
});

static UNBOUND_LOCAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:local variable '(\w+)' referenced before assignment|cannot access local variable '(\w+)')",
    )
    .unwrap()
});

/// Error type used when no exception line is found.
pub const UNKNOWN_ERROR: &str = "UnknownError";

/// One `File "...", line N, in f` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub file: String,
    pub line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// The identifier an error is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissingName {
    /// `name 'x' is not defined`
    Name { name: String },
    /// `cannot import name 'x' from 'm'`
    ImportedName { name: String, module: String },
    /// `No module named 'm'`
    Module { module: String },
    /// `'T' object has no attribute 'a'`
    ObjectAttribute { type_name: String, attribute: String },
    /// `module 'm' has no attribute 'a'`
    ModuleAttribute { module: String, attribute: String },
    /// `local variable 'x' referenced before assignment`
    LocalVariable { name: String },
}

impl MissingName {
    /// The identifier to look up in the symbol table.
    pub fn undefined_name(&self) -> Option<&str> {
        match self {
            Self::Name { name }
            | Self::ImportedName { name, .. }
            | Self::LocalVariable { name } => Some(name.as_str()),
            Self::ObjectAttribute { attribute, .. } | Self::ModuleAttribute { attribute, .. } => {
                Some(attribute.as_str())
            }
            Self::Module { .. } => None,
        }
    }

    /// Class or module that lacks an attribute.
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::ObjectAttribute { type_name, .. } => Some(type_name.as_str()),
            Self::ModuleAttribute { module, .. } => Some(module.as_str()),
            _ => None,
        }
    }

    /// Module named by an import failure.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::ImportedName { module, .. } | Self::Module { module } => Some(module.as_str()),
            _ => None,
        }
    }
}

/// Structured view of a failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Exception class name without module prefix, or `UnknownError`
    pub error_type: String,
    pub message: String,
    /// Innermost frame's file
    pub error_file: Option<String>,
    pub error_line: Option<usize>,
    pub frames: Vec<Frame>,
    pub missing: Option<MissingName>,
}

impl Diagnosis {
    pub fn is_unknown(&self) -> bool {
        self.error_type == UNKNOWN_ERROR
    }

    pub fn undefined_name(&self) -> Option<&str> {
        self.missing.as_ref().and_then(MissingName::undefined_name)
    }

    /// Context query for this error site, when the failing file is known.
    pub fn context_query(&self) -> Option<ContextQuery> {
        let file = self.error_file.as_ref()?;
        let mut query = ContextQuery::new(file.clone(), self.error_type.clone());
        query.error_line = self.error_line;
        if let Some(missing) = &self.missing {
            query.undefined_name = missing.undefined_name().map(String::from);
            query.owner = missing.owner().map(String::from);
            query.module = missing.module().map(String::from);
        }
        Some(query)
    }

    /// One-line description, e.g. `NameError at main.py:3: name 'x' is not defined`.
    pub fn headline(&self) -> String {
        let location = match (&self.error_file, self.error_line) {
            (Some(file), Some(line)) => format!(" at {file}:{line}"),
            (Some(file), None) => format!(" in {file}"),
            _ => String::new(),
        };
        let message: String = self
            .message
            .lines()
            .next()
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect();
        format!("{}{}: {}", self.error_type, location, message)
    }
}

/// Parse a failure report. Never fails; unrecognised input becomes `UnknownError`.
pub fn parse_traceback(report: &str) -> Diagnosis {
    let frames: Vec<Frame> = FRAME
        .captures_iter(report)
        .filter_map(|caps| {
            Some(Frame {
                file: caps.get(1)?.as_str().to_string(),
                line: caps.get(2)?.as_str().parse().ok()?,
                function: caps.get(3).map(|m| m.as_str().to_string()),
            })
        })
        .collect();

    let exception = report
        .lines()
        .rev()
        .map(str::trim)
        .find_map(|line| EXCEPTION_LINE.captures(line));

    let (error_type, message) = match exception {
        Some(caps) => {
            let qualified = caps.get(1).map(|m| m.as_str()).unwrap_or(UNKNOWN_ERROR);
            let short = qualified.rsplit('.').next().unwrap_or(qualified);
            (
                short.to_string(),
                caps.get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
            )
        }
        None => (UNKNOWN_ERROR.to_string(), report.trim().to_string()),
    };

    let missing = extract_missing_name(&error_type, &message);
    let last = frames.last();

    Diagnosis {
        error_file: last.map(|f| f.file.clone()),
        error_line: last.map(|f| f.line),
        error_type,
        message,
        frames,
        missing,
    }
}

/// Apply the rule for `error_type` to the exception message.
pub fn extract_missing_name(error_type: &str, message: &str) -> Option<MissingName> {
    match error_type {
        "NameError" => {
            let caps = NAME_NOT_DEFINED.captures(message)?;
            Some(MissingName::Name {
                name: caps[1].to_string(),
            })
        }
        "ImportError" | "ModuleNotFoundError" => {
            if let Some(caps) = CANNOT_IMPORT.captures(message) {
                return Some(MissingName::ImportedName {
                    name: caps[1].to_string(),
                    module: caps[2].to_string(),
                });
            }
            let caps = NO_MODULE.captures(message)?;
            Some(MissingName::Module {
                module: caps[1].to_string(),
            })
        }
        "AttributeError" => {
            if let Some(caps) = MODULE_ATTRIBUTE.captures(message) {
                return Some(MissingName::ModuleAttribute {
                    module: caps[1].to_string(),
                    attribute: caps[2].to_string(),
                });
            }
            let caps = OBJECT_ATTRIBUTE.captures(message)?;
            Some(MissingName::ObjectAttribute {
                type_name: caps[1].to_string(),
                attribute: caps[2].to_string(),
            })
        }
        "UnboundLocalError" => {
            let caps = UNBOUND_LOCAL.captures(message)?;
            let name = caps.get(1).or_else(|| caps.get(2))?;
            Some(MissingName::LocalVariable {
                name: name.as_str().to_string(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME_ERROR: &str = r#"Traceback (most recent call last):
  File "/tmp/run/main.py", line 7, in <module>
    main()
  File "/tmp/run/main.py", line 4, in main
    print(helllo)
NameError: name 'helllo' is not defined"#;

    #[test]
    fn test_name_error() {
        let d = parse_traceback(NAME_ERROR);
        assert_eq!(d.error_type, "NameError");
        assert_eq!(d.message, "name 'helllo' is not defined");
        assert_eq!(d.error_file.as_deref(), Some("/tmp/run/main.py"));
        assert_eq!(d.error_line, Some(4));
        assert_eq!(d.frames.len(), 2);
        assert_eq!(d.frames[1].function.as_deref(), Some("main"));
        assert_eq!(d.undefined_name(), Some("helllo"));
        assert_eq!(
            d.headline(),
            "NameError at /tmp/run/main.py:4: name 'helllo' is not defined"
        );
    }

    #[test]
    fn test_import_errors() {
        let d = parse_traceback("ImportError: cannot import name 'calc' from 'utils' (/p/utils.py)");
        assert_eq!(
            d.missing,
            Some(MissingName::ImportedName {
                name: "calc".into(),
                module: "utils".into()
            })
        );

        let d = parse_traceback("ModuleNotFoundError: No module named 'pkg.helpers'");
        assert_eq!(d.missing.as_ref().and_then(MissingName::module), Some("pkg.helpers"));
        assert_eq!(d.undefined_name(), None);
    }

    #[test]
    fn test_attribute_errors() {
        let d = parse_traceback("AttributeError: 'Circle' object has no attribute 'areaa'");
        let m = d.missing.unwrap();
        assert_eq!(m.owner(), Some("Circle"));
        assert_eq!(m.undefined_name(), Some("areaa"));

        let d = parse_traceback("AttributeError: module 'utils' has no attribute 'calcualte'");
        assert!(matches!(d.missing, Some(MissingName::ModuleAttribute { .. })));

        let d = parse_traceback("AttributeError: type object 'Config' has no attribute 'load'");
        assert_eq!(d.missing.unwrap().owner(), Some("Config"));
    }

    #[test]
    fn test_unbound_local() {
        let d = parse_traceback(
            "UnboundLocalError: cannot access local variable 'total' where it is not associated with a value",
        );
        assert_eq!(d.undefined_name(), Some("total"));
        let d = parse_traceback("UnboundLocalError: local variable 'n' referenced before assignment");
        assert_eq!(d.undefined_name(), Some("n"));
    }

    #[test]
    fn test_qualified_and_unknown() {
        let d = parse_traceback("json.decoder.JSONDecodeError: Expecting value: line 1 column 1");
        assert_eq!(d.error_type, "JSONDecodeError");
        assert!(d.missing.is_none());

        let d = parse_traceback("Segmentation fault (core dumped)");
        assert!(d.is_unknown());
        assert_eq!(d.message, "Segmentation fault (core dumped)");
        assert!(d.context_query().is_none());
    }

    #[test]
    fn test_context_query() {
        let report = "  File \"app/main.py\", line 2, in <module>\nAttributeError: 'Circle' object has no attribute 'areaa'";
        let query = parse_traceback(report).context_query().unwrap();
        assert_eq!(query.error_file, "app/main.py");
        assert_eq!(query.error_line, Some(2));
        assert_eq!(query.undefined_name.as_deref(), Some("areaa"));
        assert_eq!(query.owner.as_deref(), Some("Circle"));
    }
}
