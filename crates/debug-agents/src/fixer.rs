//! Fix response parsing and multi-file edit application.
//!
//! Single-file fixes come back as delimited sections:
//!
//! ```text
//! ===FIXED_CODE===
//! ...
//! ===END_CODE===
//! ===EXPLANATION===
//! ...
//! ===END_EXPLANATION===
//! ===CHANGES===
//! - ...
//! ===END_CHANGES===
//! ```
//!
//! A fenced python block is accepted when the code markers are missing.
//! Multi-file fixes are a JSON object of per-file `{old, new}` block
//! replacements applied to an in-memory copy of the project.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::action::{extract_json_object, parse_json_lenient};

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:python|py|python3)?[ \t]*\r?\n(.*?)```").unwrap()
});

static LIST_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s*").unwrap());

/// Parsed single-file fix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixResponse {
    pub fixed_code: Option<String>,
    pub explanation: String,
    pub changes: Vec<String>,
}

/// Extract the code, explanation and change list from a fix response.
pub fn parse_fix_response(text: &str) -> FixResponse {
    let fixed_code = section(text, "===FIXED_CODE===", "===END_CODE===")
        .map(strip_fence)
        .or_else(|| {
            FENCED_CODE
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
        .map(|code| code.trim_matches('\n').to_string())
        .filter(|code| !code.trim().is_empty());

    let explanation = section(text, "===EXPLANATION===", "===END_EXPLANATION===")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let changes = section(text, "===CHANGES===", "===END_CHANGES===")
        .map(|s| {
            s.lines()
                .map(|line| LIST_BULLET.replace(line.trim(), "").trim().to_string())
                .filter(|line| !line.is_empty())
                .collect()
        })
        .unwrap_or_default();

    FixResponse {
        fixed_code,
        explanation,
        changes,
    }
}

/// Text between `start` and `end` (or end of input when `end` is missing).
fn section<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let rest = &text[from..];
    Some(rest.find(end).map_or(rest, |to| &rest[..to]))
}

/// Models sometimes fence the code inside the markers too.
fn strip_fence(code: &str) -> String {
    match FENCED_CODE.captures(code).and_then(|c| c.get(1)) {
        Some(inner) if code.trim_start().starts_with("```") => inner.as_str().to_string(),
        _ => code.to_string(),
    }
}

// ── Multi-file fixes ────────────────────────────────────────────────────────

/// One block replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub old: String,
    pub new: String,
}

/// `{analysis, fixed_files: {path: [{old, new}]}, explanation}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiFileFix {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub fixed_files: BTreeMap<String, Vec<FileEdit>>,
    #[serde(default)]
    pub explanation: String,
}

pub fn parse_multi_file_response(text: &str) -> Result<MultiFileFix, String> {
    let raw = extract_json_object(text).ok_or("response contains no JSON object")?;
    let value = parse_json_lenient(raw).map_err(|e| format!("invalid JSON: {e}"))?;
    serde_json::from_value(value).map_err(|e| format!("unexpected JSON shape: {e}"))
}

/// What applying a [`MultiFileFix`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    /// Files that changed, in path order.
    pub changed_files: Vec<String>,
    /// `(file, first line of the old block)` for blocks not found verbatim.
    pub unmatched: Vec<(String, String)>,
    /// Paths not present in the project.
    pub unknown_files: Vec<String>,
}

/// Apply each `old → new` replacement (first occurrence) to `files`.
///
/// An edit with an empty `old` block on an unknown path creates that file.
pub fn apply_multi_file_fix(files: &mut BTreeMap<String, String>, fix: &MultiFileFix) -> ApplyReport {
    let mut report = ApplyReport::default();
    for (path, edits) in &fix.fixed_files {
        let path = path.trim_start_matches("./").to_string();
        let Some(content) = files.get_mut(&path) else {
            let creates: Vec<&FileEdit> = edits.iter().filter(|e| e.old.is_empty()).collect();
            if creates.is_empty() {
                report.unknown_files.push(path);
            } else {
                let body: String = creates.iter().map(|e| e.new.as_str()).collect();
                files.insert(path.clone(), body);
                report.applied += creates.len();
                report.changed_files.push(path);
            }
            continue;
        };

        let before = content.clone();
        for edit in edits {
            if !edit.old.is_empty() && content.contains(&edit.old) {
                *content = content.replacen(&edit.old, &edit.new, 1);
                report.applied += 1;
            } else {
                let first_line = edit.old.lines().next().unwrap_or_default().trim().to_string();
                report.unmatched.push((path.clone(), first_line));
            }
        }
        if *content != before {
            report.changed_files.push(path);
        }
    }
    report
}
