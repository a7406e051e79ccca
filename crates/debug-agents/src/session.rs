//! Session input and output types shared by both control flows.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diagnostics::budget::truncate_chars;
use diagnostics::loop_detector::LoopSummary;
use diagnostics::sandbox::{ExecutionResult, SandboxExecutor};
use serde::{Deserialize, Serialize};

use crate::completion::CompletionService;
use crate::error::{AgentError, AgentResult};
use crate::knowledge::KnowledgeRetriever;
use crate::state_machine::TransitionRecord;

/// Characters of a failed attempt's explanation kept in the failure history.
pub const FAILURE_EXPLANATION_CHARS: usize = 200;
/// Characters of a failed attempt's error output kept in the failure history.
pub const FAILURE_ERROR_CHARS: usize = 300;

/// File name used for the buggy source when no project path is known.
pub const DEFAULT_ENTRY: &str = diagnostics::sandbox::ENTRY_FILE;

/// One debugging request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub buggy_source: String,
    /// Traceback or other failure output
    pub failure_report: String,
    pub project_root: Option<PathBuf>,
    /// Project-relative path of the buggy file, when known
    pub source_path: Option<String>,
    /// Project-relative script that starts the program. Defaults to the
    /// outermost traceback frame inside the project, else the buggy file.
    pub entry_script: Option<String>,
    /// Supervisor: retries after the first attempt. Loop: iterations.
    pub budget: u32,
}

impl SessionRequest {
    pub fn new(buggy_source: impl Into<String>, failure_report: impl Into<String>, budget: u32) -> Self {
        Self {
            buggy_source: buggy_source.into(),
            failure_report: failure_report.into(),
            project_root: None,
            source_path: None,
            entry_script: None,
            budget,
        }
    }

    pub fn with_project(mut self, root: impl Into<PathBuf>, source_path: Option<String>) -> Self {
        self.project_root = Some(root.into());
        self.source_path = source_path;
        self
    }

    pub fn with_entry_script(mut self, entry: impl Into<String>) -> Self {
        self.entry_script = Some(entry.into());
        self
    }

    /// Reject inputs no session could work with.
    pub fn validate(&self) -> AgentResult<()> {
        if self.buggy_source.trim().is_empty() {
            return Err(AgentError::invalid("buggy source is empty"));
        }
        if self.failure_report.trim().is_empty() {
            return Err(AgentError::invalid("failure report is empty"));
        }
        if self.budget == 0 {
            return Err(AgentError::invalid("retry/iteration budget must be positive"));
        }
        if let Some(root) = &self.project_root {
            if !root.is_dir() {
                return Err(AgentError::invalid(format!(
                    "project root {} is not an existing directory",
                    root.display()
                )));
            }
        }
        Ok(())
    }
}

/// One verified candidate. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub candidate_fix: String,
    pub explanation: String,
    pub verification_result: ExecutionResult,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(
        attempt_number: u32,
        candidate_fix: impl Into<String>,
        explanation: impl Into<String>,
        verification_result: ExecutionResult,
    ) -> Self {
        Self {
            attempt_number,
            candidate_fix: candidate_fix.into(),
            explanation: explanation.into(),
            verification_result,
            timestamp: Utc::now(),
        }
    }
}

/// Trimmed record of a failed attempt, fed back into later fix prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub explanation: String,
    pub error: String,
}

impl FailureRecord {
    pub fn new(explanation: &str, error: &str) -> Self {
        Self {
            explanation: truncate_chars(explanation.trim(), FAILURE_EXPLANATION_CHARS),
            error: truncate_chars(error.trim(), FAILURE_ERROR_CHARS),
        }
    }
}

/// Session result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub success: bool,
    pub fixed_source: String,
    pub explanation: String,
    pub attempt_count: usize,
    pub attempts: Vec<AttemptRecord>,
    pub loop_detector_summary: LoopSummary,
    /// Orchestration loop only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionRecord>,
}

/// The three external collaborators a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub completion: Arc<dyn CompletionService>,
    pub sandbox: Arc<dyn SandboxExecutor>,
    pub knowledge: Arc<dyn KnowledgeRetriever>,
}

impl Collaborators {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        sandbox: Arc<dyn SandboxExecutor>,
        knowledge: Arc<dyn KnowledgeRetriever>,
    ) -> Self {
        Self {
            completion,
            sandbox,
            knowledge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(SessionRequest::new("print(x)", "NameError", 3).validate().is_ok());
        assert!(SessionRequest::new("  ", "NameError", 3).validate().is_err());
        assert!(SessionRequest::new("print(x)", "", 3).validate().is_err());
        assert!(SessionRequest::new("print(x)", "NameError", 0).validate().is_err());

        let missing = SessionRequest::new("print(x)", "NameError", 3)
            .with_project("/definitely/not/a/real/dir", None);
        let err = missing.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_failure_record_trims() {
        let long = "x".repeat(1000);
        let record = FailureRecord::new(&long, &long);
        assert!(record.explanation.len() < 250);
        assert!(record.error.len() < 350);
        assert!(record.error.ends_with("[truncated]"));
    }
}
