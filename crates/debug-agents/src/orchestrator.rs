//! Orchestration Loop: think/act/observe over a fixed tool table.
//!
//! Each iteration asks the completion service for the next step given the
//! whole transcript, parses it into an [`Action`] or a final answer, runs the
//! tool, and appends the observation. Progress is tracked by an explicit
//! [`StateMachine`]; every transition is logged into the session report.
//!
//! ## Termination
//!
//! - **Done**: a final answer naming code that `verify_fix` ran successfully.
//! - **Failed**: `max_iterations` spent without that. The last candidate (or
//!   the original source) is returned with `success = false`.
//!
//! Collaborator failures never end a session; they become observations.

use diagnostics::budget::{compress_knowledge, truncate_chars, TokenBudget, TokenBudgetCompressor};
use diagnostics::context::{keys, ContextBundle};
use diagnostics::loop_detector::{Attempt, Fingerprint, LoopDetector, LoopDetectorConfig};
use diagnostics::project::ScanConfig;
use diagnostics::traceback::{parse_traceback, Diagnosis};
use tracing::{debug, info, warn};

use crate::action::{
    parse_step, Action, FinalAnswer, FetchProjectContextArgs, MultiFileFixArgs, ParseOutcome,
    ProposeFixArgs, RetrieveKnowledgeArgs, ToolName, VerifyFixArgs,
};
use crate::completion::ChatMessage;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::fixer::{apply_multi_file_fix, parse_fix_response, parse_multi_file_response};
use crate::prompts::{
    multi_file_prompt, react_system_prompt, task_message, FixPrompt, FIX_SYSTEM_PREAMBLE,
    MULTI_FILE_SYSTEM_PREAMBLE,
};
use crate::session::{AttemptRecord, Collaborators, FailureRecord, SessionReport, SessionRequest};
use crate::state_machine::{LoopEvent, StateMachine};
use crate::workspace::Workspace;

/// Characters of one observation kept in the transcript.
pub const DEFAULT_OBSERVATION_LIMIT: usize = 4_000;
/// Consecutive calls of one tool after which the call is skipped.
pub const DEFAULT_REPEAT_LIMIT: usize = 3;
/// Knowledge hits requested when the model gives no `top_k`.
pub const DEFAULT_TOP_K: usize = 5;

const KNOWLEDGE_KEEP: usize = 3;
const KNOWLEDGE_CHARS: usize = 500;
const VERIFY_OUTPUT_CHARS: usize = 1_500;

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub observation_limit: usize,
    pub repeat_limit: usize,
    pub default_top_k: usize,
    pub budget: TokenBudget,
    pub loop_detection: LoopDetectorConfig,
    pub scan: ScanConfig,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            observation_limit: DEFAULT_OBSERVATION_LIMIT,
            repeat_limit: DEFAULT_REPEAT_LIMIT,
            default_top_k: DEFAULT_TOP_K,
            budget: TokenBudget::default(),
            loop_detection: LoopDetectorConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            budget: config.budget.clone(),
            loop_detection: config.loop_detection.clone(),
            scan: config.scan.clone(),
            ..Self::default()
        }
    }
}

// ── OrchestrationLoop ─────────────────────────────────────────────────────────

pub struct OrchestrationLoop {
    collaborators: Collaborators,
    settings: LoopSettings,
}

impl OrchestrationLoop {
    pub fn new(collaborators: Collaborators, settings: LoopSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }

    /// Run one session. `request.budget` is the iteration limit.
    ///
    /// Only invalid input is returned as an error.
    pub async fn run(&self, request: &SessionRequest) -> AgentResult<SessionReport> {
        request.validate()?;
        let diagnosis = parse_traceback(&request.failure_report);
        let workspace = Workspace::open(request, &diagnosis, &self.settings.scan);
        info!(
            error_type = %diagnosis.error_type,
            target = %workspace.target(),
            entry_script = %workspace.entry_script(),
            project = workspace.has_project(),
            max_iterations = request.budget,
            "Starting orchestration loop"
        );

        let transcript = vec![
            ChatMessage::system(react_system_prompt()),
            ChatMessage::user(task_message(
                &request.buggy_source,
                &request.failure_report,
                workspace.target(),
                workspace.has_project(),
            )),
        ];

        let session = LoopSession {
            collaborators: &self.collaborators,
            settings: &self.settings,
            request,
            diagnosis,
            workspace,
            transcript,
            machine: StateMachine::new(),
            detector: LoopDetector::new(self.settings.loop_detection.clone()),
            gathered: ContextBundle::new(),
            candidate: None,
            verified: Vec::new(),
            attempts: Vec::new(),
            failures: Vec::new(),
            tool_streak: None,
        };
        session.drive().await
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    code: String,
    explanation: String,
}

impl Candidate {
    fn same_code(&self, code: &str) -> bool {
        Fingerprint::of_code(&self.code) == Fingerprint::of_code(code)
    }
}

/// Mutable state of one running session.
struct LoopSession<'a> {
    collaborators: &'a Collaborators,
    settings: &'a LoopSettings,
    request: &'a SessionRequest,
    diagnosis: Diagnosis,
    workspace: Workspace,
    transcript: Vec<ChatMessage>,
    machine: StateMachine,
    detector: LoopDetector,
    /// Context and knowledge collected by tools, fed into `propose_fix`
    gathered: ContextBundle,
    candidate: Option<Candidate>,
    verified: Vec<Candidate>,
    attempts: Vec<AttemptRecord>,
    failures: Vec<FailureRecord>,
    tool_streak: Option<(ToolName, usize)>,
}

impl LoopSession<'_> {
    async fn drive(mut self) -> AgentResult<SessionReport> {
        let max_iterations = self.request.budget;

        for iteration in 1..=max_iterations {
            self.machine.set_iteration(iteration);
            info!(iteration, max_iterations, "Thinking");

            let reply = match self.collaborators.completion.complete(&self.transcript).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(iteration, error = %e, "Completion failed");
                    self.machine.apply(LoopEvent::StepRejected, Some("completion_failed"))?;
                    self.observe(format!("Error: {e}. Continue with your next step."))?;
                    continue;
                }
            };
            self.transcript.push(ChatMessage::assistant(reply.clone()));

            match parse_step(&reply) {
                ParseOutcome::Final { answer, .. } => {
                    if let Some(accepted) = self.accept_final(&answer) {
                        self.machine.apply(LoopEvent::FinalAccepted, None)?;
                        info!(iteration, attempts = self.attempts.len(), "Verified fix accepted");
                        return Ok(self.finish(true, accepted.code, accepted.explanation));
                    }
                    self.machine.apply(LoopEvent::StepRejected, Some("unverified_final"))?;
                    self.observe(
                        "Error: final answer rejected. No successful verify_fix run matches this \
                         code. Call verify_fix before giving the Final Answer."
                            .to_string(),
                    )?;
                }
                ParseOutcome::UnknownTool { name, .. } => {
                    warn!(iteration, tool = %name, "Unknown tool requested");
                    self.machine.apply(LoopEvent::StepRejected, Some("unknown_tool"))?;
                    let available: Vec<&str> = ToolName::ALL.iter().map(|t| t.as_str()).collect();
                    self.observe(format!(
                        "Error: unknown tool '{name}'. Available tools: {}",
                        available.join(", ")
                    ))?;
                }
                ParseOutcome::Malformed { reason } => {
                    warn!(iteration, reason = %reason, "Malformed step");
                    self.machine.apply(LoopEvent::StepRejected, Some("malformed"))?;
                    self.observe(format!(
                        "Error: could not parse your reply ({reason}). Answer with \
                         `Thought:` followed by either `Action:` and `Action Input:` or `Final Answer:`."
                    ))?;
                }
                ParseOutcome::Step { action, .. } => {
                    let tool = action.tool();
                    self.machine.apply(LoopEvent::StepParsed, Some(tool.as_str()))?;
                    let observation = if self.record_call(tool) {
                        warn!(iteration, tool = %tool, "Repeated tool call skipped");
                        self.machine.apply(LoopEvent::ToolFinished, Some("skipped_repeat"))?;
                        format!(
                            "WARNING: you have called {tool} {} times in a row and it is not \
                             helping. The call was skipped. Choose a different tool or approach.",
                            self.settings.repeat_limit
                        )
                    } else {
                        let observation = self.dispatch(action).await;
                        self.machine.apply(LoopEvent::ToolFinished, None)?;
                        observation
                    };
                    self.observe(observation)?;
                }
            }
        }

        self.machine.apply(LoopEvent::BudgetExhausted, None)?;
        warn!(max_iterations, attempts = self.attempts.len(), "Iteration budget exhausted");
        let fixed_source = self
            .candidate
            .as_ref()
            .map(|c| c.code.clone())
            .unwrap_or_else(|| self.request.buggy_source.clone());
        let explanation = format!("No verified fix within {max_iterations} iterations");
        Ok(self.finish(false, fixed_source, explanation))
    }

    /// Append an observation and return to `Thinking`.
    fn observe(&mut self, observation: String) -> AgentResult<()> {
        let text = truncate_chars(&observation, self.settings.observation_limit);
        self.transcript.push(ChatMessage::user(format!("Observation: {text}")));
        self.machine.apply(LoopEvent::ObservationRecorded, None)?;
        Ok(())
    }

    /// Track consecutive calls; `true` when this call should be skipped.
    fn record_call(&mut self, tool: ToolName) -> bool {
        let streak = match self.tool_streak {
            Some((last, n)) if last == tool => n + 1,
            _ => 1,
        };
        self.tool_streak = Some((tool, streak));
        !tool.may_repeat() && streak >= self.settings.repeat_limit
    }

    fn accept_final(&self, answer: &FinalAnswer) -> Option<Candidate> {
        let named = answer.fixed_code.as_deref().filter(|c| !c.trim().is_empty());
        let verified = match named {
            Some(code) => self.verified.iter().rev().find(|v| v.same_code(code)),
            None => self.verified.last(),
        }?;
        let explanation = answer
            .explanation
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| verified.explanation.clone());
        Some(Candidate {
            code: verified.code.clone(),
            explanation,
        })
    }

    fn finish(self, success: bool, fixed_source: String, explanation: String) -> SessionReport {
        let iterations = self.machine.iteration();
        SessionReport {
            success,
            fixed_source,
            explanation,
            attempt_count: self.attempts.len(),
            loop_detector_summary: self.detector.summary(),
            attempts: self.attempts,
            iterations: Some(iterations),
            transitions: self.machine.into_transitions(),
        }
    }

    // ── Tools ─────────────────────────────────────────────────────────────────

    async fn dispatch(&mut self, action: Action) -> String {
        debug!(tool = %action.tool(), iteration = self.machine.iteration(), "Dispatching tool");
        match action {
            Action::DiagnoseError(_) => self.diagnose_error(),
            Action::RetrieveKnowledge(args) => self.retrieve_knowledge(args).await,
            Action::FetchProjectContext(args) => self.fetch_project_context(args),
            Action::ProposeFix(args) => self.propose_fix(args).await,
            Action::VerifyFix(args) => self.verify_fix(args).await,
            Action::MultiFileFix(args) => self.multi_file_fix(args).await,
        }
    }

    fn diagnose_error(&self) -> String {
        let d = &self.diagnosis;
        let mut out = format!("Error type: {}\nMessage: {}\n", d.error_type, d.message);
        if let Some(file) = &d.error_file {
            match d.error_line {
                Some(line) => out.push_str(&format!("Location: {file}:{line}\n")),
                None => out.push_str(&format!("Location: {file}\n")),
            }
        }
        if let Some(name) = d.undefined_name() {
            out.push_str(&format!("Undefined name: {name}\n"));
        }
        if let Some(missing) = &d.missing {
            if let Some(owner) = missing.owner() {
                out.push_str(&format!("Owner: {owner}\n"));
            }
            if let Some(module) = missing.module() {
                out.push_str(&format!("Module: {module}\n"));
            }
        }
        out.push_str(&format!("Stack frames: {}\n", d.frames.len()));
        if self.workspace.has_project() {
            out.push_str("A project is available: fetch_project_context can show definitions and imports.\n");
        }
        out
    }

    async fn retrieve_knowledge(&mut self, args: RetrieveKnowledgeArgs) -> String {
        let query = if args.query.trim().is_empty() {
            self.diagnosis.headline()
        } else {
            args.query
        };
        let top_k = args.top_k.filter(|k| *k > 0).unwrap_or(self.settings.default_top_k);

        match self.collaborators.knowledge.search(&query, top_k).await {
            Ok(hits) if hits.is_empty() => "No similar solutions found.".to_string(),
            Ok(hits) => {
                let contents: Vec<String> = hits.into_iter().map(|h| h.content).collect();
                let kept = compress_knowledge(&contents, KNOWLEDGE_KEEP, KNOWLEDGE_CHARS);
                self.gathered.insert(keys::RAG_SOLUTIONS, kept.clone());
                let mut out = format!("Found {} similar solution(s):\n", kept.len());
                for (i, snippet) in kept.iter().enumerate() {
                    out.push_str(&format!("{}. {}\n", i + 1, snippet));
                }
                out
            }
            Err(e) => {
                warn!(error = %e, "Knowledge retrieval failed");
                format!("Knowledge retrieval failed: {e}")
            }
        }
    }

    fn fetch_project_context(&mut self, args: FetchProjectContextArgs) -> String {
        let bundle = match self
            .workspace
            .context_for(&self.diagnosis, args.undefined_name.as_deref())
        {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                return "No project root is configured; only the buggy file is available.".to_string()
            }
            Err(e) => {
                warn!(error = %e, "Context assembly failed");
                return format!("Error: context assembly failed: {e}");
            }
        };
        if bundle.is_empty() {
            return "No cross-file context found for this error.".to_string();
        }

        let compressor = TokenBudgetCompressor::from_budget(&self.settings.budget);
        let (compressed, report) = compressor.compress_with_report(&bundle, self.settings.budget.available());
        if report.was_compressed() {
            debug!(
                original = report.original_tokens,
                compressed = report.compressed_tokens,
                dropped = ?report.dropped_keys,
                "Project context compressed"
            );
        }
        for (key, value) in compressed.iter() {
            self.gathered.insert(key, value.clone());
        }
        compressed.render()
    }

    async fn propose_fix(&mut self, args: ProposeFixArgs) -> String {
        let context = if self.gathered.is_empty() {
            None
        } else {
            let compressor = TokenBudgetCompressor::from_budget(&self.settings.budget);
            Some(compressor.compress(&self.gathered, self.settings.budget.available()).render())
        };
        let prompt = FixPrompt {
            source: &self.request.buggy_source,
            diagnosis: &self.diagnosis,
            failure_report: &self.request.failure_report,
            context: context.as_deref(),
            failures: &self.failures,
            guidance: args.guidance.as_deref(),
        }
        .render();
        let messages = [ChatMessage::system(FIX_SYSTEM_PREAMBLE), ChatMessage::user(prompt)];

        let response = match self.collaborators.completion.complete(&messages).await {
            Ok(text) => parse_fix_response(&text),
            Err(e) => {
                warn!(error = %e, "Fix generation failed");
                return format!("Error: fix generation failed: {e}");
            }
        };
        let Some(code) = response.fixed_code else {
            return "Error: the fix response contained no code. Try propose_fix again with guidance."
                .to_string();
        };

        let check = self.detector.check(&Attempt::candidate(code.clone()));
        if check.is_loop {
            return format!(
                "{}\nThe candidate was not accepted. Propose a different fix.",
                check.warning()
            );
        }

        let mut out = format!("Proposed fix:\n```python\n{code}\n```\n");
        if !response.explanation.is_empty() {
            out.push_str(&format!("Explanation: {}\n", response.explanation));
        }
        for change in &response.changes {
            out.push_str(&format!("- {change}\n"));
        }
        out.push_str("Call verify_fix to test it.");
        self.candidate = Some(Candidate {
            code,
            explanation: response.explanation,
        });
        out
    }

    async fn verify_fix(&mut self, args: VerifyFixArgs) -> String {
        let explicit = args.code.filter(|c| !c.trim().is_empty());
        let (candidate, untracked) = match (explicit, &self.candidate) {
            (Some(code), Some(current)) if current.same_code(&code) => (current.clone(), false),
            (Some(code), current) => (
                Candidate {
                    code,
                    explanation: current
                        .as_ref()
                        .map(|c| c.explanation.clone())
                        .unwrap_or_default(),
                },
                true,
            ),
            (None, Some(current)) => (current.clone(), false),
            (None, None) => return "Error: nothing to verify. Call propose_fix first.".to_string(),
        };

        let result = self
            .collaborators
            .sandbox
            .run(&self.workspace.program(&candidate.code))
            .await;
        let attempt_number = self.attempts.len() as u32 + 1;
        self.attempts.push(AttemptRecord::new(
            attempt_number,
            candidate.code.clone(),
            candidate.explanation.clone(),
            result.clone(),
        ));
        self.candidate = Some(candidate.clone());

        if result.success {
            info!(attempt = attempt_number, duration_ms = result.duration_ms, "Verification succeeded");
            self.verified.push(candidate);
            let stdout = truncate_chars(result.stdout.trim(), VERIFY_OUTPUT_CHARS);
            return format!(
                "Verification succeeded (exit code 0).\nstdout:\n{stdout}\nYou may now give the Final Answer."
            );
        }

        let error = result.error_text().to_string();
        info!(attempt = attempt_number, exit_code = result.exit_code, timed_out = result.timed_out, "Verification failed");
        self.failures.push(FailureRecord::new(&candidate.explanation, &error));
        let attempt = if untracked {
            Attempt::failed(candidate.code, error.clone())
        } else {
            Attempt::error_only(error.clone())
        };
        let check = self.detector.check(&attempt);

        let mut out = format!(
            "Verification failed (exit code {}{}):\n{}",
            result.exit_code,
            if result.timed_out { ", timed out" } else { "" },
            truncate_chars(error.trim(), VERIFY_OUTPUT_CHARS)
        );
        if check.is_loop {
            out.push_str(&format!("\n\n{}", check.warning()));
        }
        out
    }

    async fn multi_file_fix(&mut self, args: MultiFileFixArgs) -> String {
        if !self.workspace.has_project() {
            return "Error: multi_file_fix needs a project root. Use propose_fix for single-file fixes."
                .to_string();
        }
        let prompt = multi_file_prompt(
            self.workspace.files(),
            &self.diagnosis,
            &self.request.failure_report,
            args.guidance.as_deref(),
        );
        let messages = [ChatMessage::system(MULTI_FILE_SYSTEM_PREAMBLE), ChatMessage::user(prompt)];
        let text = match self.collaborators.completion.complete(&messages).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Multi-file fix generation failed");
                return format!("Error: multi-file fix generation failed: {e}");
            }
        };
        let fix = match parse_multi_file_response(&text) {
            Ok(fix) => fix,
            Err(reason) => return format!("Error: could not parse the multi-file fix: {reason}"),
        };

        let snapshot = self.workspace.files().clone();
        let report = apply_multi_file_fix(self.workspace.files_mut(), &fix);
        let target = self.workspace.target().to_string();

        if report.changed_files.contains(&target) {
            let code = self.workspace.files().get(&target).cloned().unwrap_or_default();
            let check = self.detector.check(&Attempt::candidate(code.clone()));
            if check.is_loop {
                *self.workspace.files_mut() = snapshot;
                return format!(
                    "{}\nThe edits were not applied. Propose a different fix.",
                    check.warning()
                );
            }
            self.candidate = Some(Candidate {
                code,
                explanation: fix.explanation.clone(),
            });
        } else if !report.changed_files.is_empty() {
            let code = self
                .candidate
                .as_ref()
                .map(|c| c.code.clone())
                .unwrap_or_else(|| self.request.buggy_source.clone());
            self.candidate = Some(Candidate {
                code,
                explanation: fix.explanation.clone(),
            });
        }

        info!(
            applied = report.applied,
            changed = report.changed_files.len(),
            unmatched = report.unmatched.len(),
            "Multi-file fix applied"
        );
        let mut out = if report.changed_files.is_empty() {
            "No edits could be applied.\n".to_string()
        } else {
            format!(
                "Applied {} edit(s) to: {}\n",
                report.applied,
                report.changed_files.join(", ")
            )
        };
        for (file, old) in &report.unmatched {
            out.push_str(&format!(
                "Unmatched block in {file}:\n{}\n",
                truncate_chars(old, 300)
            ));
        }
        for file in &report.unknown_files {
            out.push_str(&format!("Unknown file: {file}\n"));
        }
        if !fix.explanation.is_empty() {
            out.push_str(&format!("Explanation: {}\n", fix.explanation));
        }
        if !report.changed_files.is_empty() {
            out.push_str("Call verify_fix to test the result.");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::MockCompletionService;
    use crate::error::AgentError;
    use crate::knowledge::NoKnowledge;
    use async_trait::async_trait;
    use diagnostics::sandbox::{ExecutionResult, Program, SandboxExecutor};
    use std::sync::Arc;

    struct AlwaysPasses;

    #[async_trait]
    impl SandboxExecutor for AlwaysPasses {
        async fn run(&self, _program: &Program) -> ExecutionResult {
            ExecutionResult {
                success: true,
                stdout: "hello\n".into(),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
                duration_ms: 1,
            }
        }
    }

    fn collaborators(completion: MockCompletionService) -> Collaborators {
        Collaborators::new(Arc::new(completion), Arc::new(AlwaysPasses), Arc::new(NoKnowledge))
    }

    #[tokio::test]
    async fn test_premature_final_answer_is_rejected() {
        let mut completion = MockCompletionService::new();
        completion.expect_complete().returning(|_| {
            Ok("Thought: done\nFinal Answer: {\"fixed_code\": \"print('hello')\"}".to_string())
        });

        let orchestrator = OrchestrationLoop::new(collaborators(completion), LoopSettings::default());
        let request = SessionRequest::new("print(helllo)", "NameError: name 'helllo' is not defined", 2);
        let report = orchestrator.run(&request).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.fixed_source, "print(helllo)");
        assert_eq!(report.iterations, Some(2));
        let last = report.transitions.last().unwrap();
        assert_eq!(last.event, LoopEvent::BudgetExhausted);
    }

    #[tokio::test]
    async fn test_completion_errors_become_observations() {
        let mut completion = MockCompletionService::new();
        completion
            .expect_complete()
            .times(3)
            .returning(|_| Err(AgentError::Completion("connection refused".into())));

        let orchestrator = OrchestrationLoop::new(collaborators(completion), LoopSettings::default());
        let request = SessionRequest::new("print(x)", "NameError: name 'x' is not defined", 3);
        let report = orchestrator.run(&request).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.attempt_count, 0);
        let rejected = report
            .transitions
            .iter()
            .filter(|t| t.reason.as_deref() == Some("completion_failed"))
            .count();
        assert_eq!(rejected, 3);
    }

    #[tokio::test]
    async fn test_invalid_request_fails_fast() {
        let completion = MockCompletionService::new();
        let orchestrator = OrchestrationLoop::new(collaborators(completion), LoopSettings::default());
        let err = orchestrator
            .run(&SessionRequest::new("", "NameError", 3))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
