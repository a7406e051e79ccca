//! Typed actions and the tolerant step parser.
//!
//! The model answers each turn with
//!
//! ```text
//! Thought: <reasoning>
//! Action: <tool name>
//! Action Input: {"json": "object"}
//! ```
//!
//! or ends the session with `Final Answer: {"fixed_code": ..., "explanation": ...}`.
//! Model output is often slightly off (code fences, prose around the JSON,
//! raw newlines inside strings), so the JSON object is located with a
//! bracket-depth scanner rather than a strict parser, and unknown tool names
//! are reported as their own outcome instead of being dropped.

use std::fmt;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Tool names ──────────────────────────────────────────────────────────────

/// The fixed tool dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    DiagnoseError,
    RetrieveKnowledge,
    FetchProjectContext,
    ProposeFix,
    VerifyFix,
    MultiFileFix,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        Self::DiagnoseError,
        Self::RetrieveKnowledge,
        Self::FetchProjectContext,
        Self::ProposeFix,
        Self::VerifyFix,
        Self::MultiFileFix,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiagnoseError => "diagnose_error",
            Self::RetrieveKnowledge => "retrieve_knowledge",
            Self::FetchProjectContext => "fetch_project_context",
            Self::ProposeFix => "propose_fix",
            Self::VerifyFix => "verify_fix",
            Self::MultiFileFix => "multi_file_fix",
        }
    }

    /// Resolve a model-supplied name, accepting the legacy aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "diagnose_error" | "analyze_error" => Some(Self::DiagnoseError),
            "retrieve_knowledge" | "search_solutions" => Some(Self::RetrieveKnowledge),
            "fetch_project_context" | "get_project_context" => Some(Self::FetchProjectContext),
            "propose_fix" | "fix_code" => Some(Self::ProposeFix),
            "verify_fix" | "execute_code" => Some(Self::VerifyFix),
            "multi_file_fix" | "fix_multi_file" => Some(Self::MultiFileFix),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::DiagnoseError => {
                "Parse the failure report: error type, message, failing file and line, and the missing identifier."
            }
            Self::RetrieveKnowledge => {
                "Search the knowledge base for known fixes of similar errors."
            }
            Self::FetchProjectContext => {
                "Look up definitions, import suggestions and related files across the project."
            }
            Self::ProposeFix => {
                "Generate a fixed version of the failing file from everything gathered so far."
            }
            Self::VerifyFix => {
                "Run the proposed fix (or the given code) in the sandbox and report the result."
            }
            Self::MultiFileFix => {
                "Fix bugs that span several project files by editing each affected file."
            }
        }
    }

    /// JSON schema of this tool's arguments.
    pub fn args_schema(self) -> Value {
        let schema = match self {
            Self::DiagnoseError => schemars::schema_for!(DiagnoseErrorArgs),
            Self::RetrieveKnowledge => schemars::schema_for!(RetrieveKnowledgeArgs),
            Self::FetchProjectContext => schemars::schema_for!(FetchProjectContextArgs),
            Self::ProposeFix => schemars::schema_for!(ProposeFixArgs),
            Self::VerifyFix => schemars::schema_for!(VerifyFixArgs),
            Self::MultiFileFix => schemars::schema_for!(MultiFileFixArgs),
        };
        serde_json::to_value(schema).unwrap_or(Value::Null)
    }

    /// Propose/verify calls legitimately repeat; other tools should not.
    pub fn may_repeat(self) -> bool {
        matches!(self, Self::ProposeFix | Self::VerifyFix)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Arguments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiagnoseErrorArgs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetrieveKnowledgeArgs {
    #[schemars(description = "Search query, usually the error message")]
    #[serde(default)]
    pub query: String,
    #[schemars(description = "Number of results (default: 5)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FetchProjectContextArgs {
    #[schemars(description = "Identifier to look up (default: the one from the traceback)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undefined_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProposeFixArgs {
    #[schemars(description = "Extra instructions for the fix, e.g. the approach to take")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VerifyFixArgs {
    #[schemars(description = "Code to run (default: the last proposed fix)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MultiFileFixArgs {
    #[schemars(description = "Extra instructions for the multi-file fix")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum Action {
    DiagnoseError(DiagnoseErrorArgs),
    RetrieveKnowledge(RetrieveKnowledgeArgs),
    FetchProjectContext(FetchProjectContextArgs),
    ProposeFix(ProposeFixArgs),
    VerifyFix(VerifyFixArgs),
    MultiFileFix(MultiFileFixArgs),
}

impl Action {
    pub fn tool(&self) -> ToolName {
        match self {
            Self::DiagnoseError(_) => ToolName::DiagnoseError,
            Self::RetrieveKnowledge(_) => ToolName::RetrieveKnowledge,
            Self::FetchProjectContext(_) => ToolName::FetchProjectContext,
            Self::ProposeFix(_) => ToolName::ProposeFix,
            Self::VerifyFix(_) => ToolName::VerifyFix,
            Self::MultiFileFix(_) => ToolName::MultiFileFix,
        }
    }

    /// Validate `args` against the argument struct for `tool`.
    pub fn from_parts(tool: ToolName, args: Value) -> Result<Self, String> {
        fn parse<T: DeserializeOwned>(tool: ToolName, args: Value) -> Result<T, String> {
            serde_json::from_value(args).map_err(|e| format!("invalid arguments for {tool}: {e}"))
        }
        let args = match args {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Ok(match tool {
            ToolName::DiagnoseError => Self::DiagnoseError(parse(tool, args)?),
            ToolName::RetrieveKnowledge => Self::RetrieveKnowledge(parse(tool, args)?),
            ToolName::FetchProjectContext => Self::FetchProjectContext(parse(tool, args)?),
            ToolName::ProposeFix => Self::ProposeFix(parse(tool, args)?),
            ToolName::VerifyFix => Self::VerifyFix(parse(tool, args)?),
            ToolName::MultiFileFix => Self::MultiFileFix(parse(tool, args)?),
        })
    }
}

/// Terminal payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalAnswer {
    #[serde(default, alias = "code", alias = "fixed_source")]
    pub fixed_code: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

// ── Step parsing ────────────────────────────────────────────────────────────

/// Result of parsing one model turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Step {
        thought: Option<String>,
        action: Action,
    },
    Final {
        thought: Option<String>,
        answer: FinalAnswer,
    },
    UnknownTool {
        thought: Option<String>,
        name: String,
    },
    Malformed {
        reason: String,
    },
}

const THOUGHT: &str = "thought:";
const ACTION: &str = "action:";
const ACTION_INPUT: &str = "action input:";
const FINAL_ANSWER: &str = "final answer:";

/// Parse one model turn.
pub fn parse_step(text: &str) -> ParseOutcome {
    let lower = text.to_ascii_lowercase();
    let action_at = find_marker(&lower, ACTION);
    let final_at = find_marker(&lower, FINAL_ANSWER);
    let thought = extract_thought(text, &lower, action_at.into_iter().chain(final_at).min());

    match (action_at, final_at) {
        (Some(a), Some(f)) if f < a => parse_final(text, f, thought),
        (Some(a), _) => parse_action(text, &lower, a, thought),
        (None, Some(f)) => parse_final(text, f, thought),
        (None, None) => ParseOutcome::Malformed {
            reason: "no `Action:` or `Final Answer:` line found".into(),
        },
    }
}

/// Byte offset of `marker` at the start of a line (ASCII-lowercased haystack).
fn find_marker(lower: &str, marker: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = lower[from..].find(marker) {
        let at = from + pos;
        let line_start = lower[..at].rfind('\n').map_or(0, |i| i + 1);
        let prefix = lower[line_start..at].trim_start_matches(|c: char| {
            c.is_whitespace() || c == '*' || c == '#' || c == '>' || c == '-'
        });
        if prefix.is_empty() {
            return Some(at);
        }
        from = at + marker.len();
    }
    None
}

fn extract_thought(text: &str, lower: &str, end: Option<usize>) -> Option<String> {
    let start = find_marker(lower, THOUGHT)? + THOUGHT.len();
    let end = end.filter(|e| *e >= start).unwrap_or(text.len());
    let thought = text[start..end].trim();
    (!thought.is_empty()).then(|| thought.to_string())
}

fn parse_final(text: &str, at: usize, thought: Option<String>) -> ParseOutcome {
    let rest = &text[at + FINAL_ANSWER.len()..];
    let answer = match extract_json_object(rest).and_then(|raw| parse_json_lenient(raw).ok()) {
        Some(Value::Object(map)) => {
            match serde_json::from_value::<FinalAnswer>(Value::Object(map)) {
                Ok(answer) => answer,
                Err(e) => {
                    return ParseOutcome::Malformed {
                        reason: format!("final answer fields are invalid: {e}"),
                    }
                }
            }
        }
        // Plain-text final answer: an explanation without code.
        _ => FinalAnswer {
            fixed_code: None,
            explanation: Some(rest.trim().to_string()).filter(|s| !s.is_empty()),
        },
    };
    ParseOutcome::Final { thought, answer }
}

fn parse_action(text: &str, lower: &str, at: usize, thought: Option<String>) -> ParseOutcome {
    let after = &text[at + ACTION.len()..];
    let line_end = after.find('\n').unwrap_or(after.len());
    let name: String = after[..line_end]
        .trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '*')
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if name.is_empty() {
        return ParseOutcome::Malformed {
            reason: "`Action:` is not followed by a tool name".into(),
        };
    }
    let Some(tool) = ToolName::from_name(&name) else {
        return ParseOutcome::UnknownTool { thought, name };
    };

    // Arguments: after `Action Input:`, else anywhere on the rest of the text.
    let input_region = match find_marker(&lower[at..], ACTION_INPUT) {
        Some(rel) => &text[at + rel + ACTION_INPUT.len()..],
        None => &after[line_end..],
    };
    let args = match extract_json_object(input_region) {
        Some(raw) => match parse_json_lenient(raw) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                return ParseOutcome::Malformed {
                    reason: "Action Input must be a JSON object".into(),
                }
            }
            Err(e) => {
                return ParseOutcome::Malformed {
                    reason: format!("Action Input is not valid JSON: {e}"),
                }
            }
        },
        None if input_region.contains('{') => {
            return ParseOutcome::Malformed {
                reason: "Action Input has unbalanced braces".into(),
            }
        }
        None => Value::Object(Map::new()),
    };

    match Action::from_parts(tool, args) {
        Ok(action) => ParseOutcome::Step { thought, action },
        Err(reason) => ParseOutcome::Malformed { reason },
    }
}

/// First balanced `{...}` in `text`, honouring string literals and escapes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// `serde_json` first; on failure, retry with raw control characters inside
/// string literals escaped (models often emit multi-line code verbatim).
pub fn parse_json_lenient(raw: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(raw).or_else(|first| {
        let repaired = escape_control_chars_in_strings(raw);
        if repaired == raw {
            Err(first)
        } else {
            serde_json::from_str(&repaired)
        }
    })
}

fn escape_control_chars_in_strings(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in raw.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}
