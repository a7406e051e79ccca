//! Prompt text for the fix requests and the orchestration loop.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever prompt content changes,
//! so a logged response can be traced back to the prompt that produced it.

use std::collections::BTreeMap;

use diagnostics::budget::truncate_chars;
use diagnostics::traceback::Diagnosis;

use crate::action::ToolName;
use crate::session::FailureRecord;

/// Prompt version. Bump on any prompt content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Characters of each file shown in a multi-file fix prompt.
pub const MULTI_FILE_CHARS_PER_FILE: usize = 6_000;

/// System preamble for single-shot fix requests.
pub const FIX_SYSTEM_PREAMBLE: &str = "\
You are an expert Python debugger. You receive a failing Python file, the error it \
raised, and facts gathered from the surrounding project. Return a complete, corrected \
version of the file.

## Rules
1. Fix the root cause, not the symptom. Do not wrap the failing line in try/except.
2. Keep everything that is unrelated to the bug exactly as it is.
3. When a name is defined in another project file, import it using the suggested \
import statement rather than redefining it.
4. If previous attempts failed, take a different approach from all of them.

## Response format
===FIXED_CODE===
<the complete corrected file>
===END_CODE===
===EXPLANATION===
<one or two sentences on the root cause and the fix>
===END_EXPLANATION===
===CHANGES===
- <one line per change>
===END_CHANGES===
";

/// System preamble for multi-file fix requests.
pub const MULTI_FILE_SYSTEM_PREAMBLE: &str = "\
You are an expert Python debugger fixing a bug that spans several files of one project. \
Edit only what is needed. Each edit replaces one exact block of existing text.

Respond with a single JSON object and nothing else:
{\"analysis\": \"<root cause>\", \
\"fixed_files\": {\"<relative path>\": [{\"old\": \"<exact existing text>\", \"new\": \"<replacement>\"}]}, \
\"explanation\": \"<what changed>\"}

To create a new file, use an empty \"old\" block.
";

/// System prompt for the think/act/observe loop, listing every tool.
pub fn react_system_prompt() -> String {
    let mut tools = String::new();
    for tool in ToolName::ALL {
        let schema = tool.args_schema();
        let args = schema
            .get("properties")
            .map(|p| p.to_string())
            .unwrap_or_else(|| "{}".to_string());
        tools.push_str(&format!("- **{tool}**: {}\n  Arguments: {args}\n", tool.description()));
    }

    format!(
        "\
You are an autonomous Python debugging agent. Work step by step: think about what you \
know, call one tool, read its observation, repeat.

## Tools
{tools}
## Response format
Every reply is exactly one of:

Thought: <your reasoning>
Action: <tool name>
Action Input: <JSON object with the tool's arguments>

or, once `verify_fix` has succeeded:

Thought: <your reasoning>
Final Answer: {{\"fixed_code\": \"<the verified code>\", \"explanation\": \"<root cause and fix>\"}}

## Strategy
1. Start with diagnose_error.
2. For NameError/ImportError/AttributeError in a project, call fetch_project_context.
3. propose_fix, then verify_fix. A final answer is only accepted after a successful verify_fix.
4. If verification fails, read the error, gather more context, and propose a different fix.
5. Use multi_file_fix only when the bug is in another file.
"
    )
}

/// Opening user message of a loop session.
pub fn task_message(source: &str, failure_report: &str, file: &str, has_project: bool) -> String {
    let project = if has_project {
        "The file is part of a multi-file project; fetch_project_context can look up other files."
    } else {
        "No project root is configured; only this file is available."
    };
    format!(
        "Fix the following Python file `{file}`.\n\n```python\n{source}\n```\n\n\
## Failure report\n```\n{}\n```\n\n{project}",
        failure_report.trim()
    )
}

/// Inputs to one single-file fix request.
pub struct FixPrompt<'a> {
    /// Always the original buggy source, never a previous candidate
    pub source: &'a str,
    pub diagnosis: &'a Diagnosis,
    pub failure_report: &'a str,
    /// Rendered, budget-compressed context
    pub context: Option<&'a str>,
    pub failures: &'a [FailureRecord],
    pub guidance: Option<&'a str>,
}

impl FixPrompt<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("## Buggy code\n```python\n");
        out.push_str(self.source);
        out.push_str("\n```\n\n## Error\n");
        out.push_str(&self.diagnosis.headline());
        out.push_str("\n\n## Failure report\n```\n");
        out.push_str(&truncate_chars(self.failure_report.trim(), 3_000));
        out.push_str("\n```\n");

        if let Some(context) = self.context.filter(|c| !c.trim().is_empty()) {
            out.push_str("\n## Project context\n");
            out.push_str(context);
            if !context.ends_with('\n') {
                out.push('\n');
            }
        }

        if !self.failures.is_empty() {
            out.push_str("\n## Previous failed attempts\n");
            out.push_str(&render_failure_history(self.failures));
            out.push_str("Do not repeat any of these approaches.\n");
        }

        if let Some(guidance) = self.guidance.filter(|g| !g.trim().is_empty()) {
            out.push_str("\n## Guidance\n");
            out.push_str(guidance.trim());
            out.push('\n');
        }
        out
    }
}

/// Numbered digest of failed attempts.
pub fn render_failure_history(failures: &[FailureRecord]) -> String {
    failures
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let explanation = if f.explanation.is_empty() {
                "(no explanation)"
            } else {
                f.explanation.as_str()
            };
            format!("Attempt {}: {}\n  Error: {}\n", i + 1, explanation, f.error)
        })
        .collect()
}

/// User message for a multi-file fix over the in-memory project copy.
pub fn multi_file_prompt(
    files: &BTreeMap<String, String>,
    diagnosis: &Diagnosis,
    failure_report: &str,
    guidance: Option<&str>,
) -> String {
    let mut out = format!(
        "## Error\n{}\n\n## Failure report\n```\n{}\n```\n\n## Project files\n",
        diagnosis.headline(),
        truncate_chars(failure_report.trim(), 3_000)
    );
    for (path, content) in files {
        out.push_str(&format!(
            "# {path}\n```python\n{}\n```\n",
            truncate_chars(content, MULTI_FILE_CHARS_PER_FILE)
        ));
    }
    if let Some(guidance) = guidance.filter(|g| !g.trim().is_empty()) {
        out.push_str(&format!("\n## Guidance\n{}\n", guidance.trim()));
    }
    out
}
