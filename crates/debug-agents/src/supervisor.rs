//! Supervisor: single-shot fix requests with verification and retry.
//!
//! Every request is built from the ORIGINAL buggy source plus a trimmed
//! history of what already failed. A failed candidate is never patched
//! again, which keeps one bad edit from compounding into the next.

use diagnostics::budget::{compress_knowledge, TokenBudget, TokenBudgetCompressor};
use diagnostics::context::{keys, ContextBundle};
use diagnostics::loop_detector::{Attempt, LoopDetector, LoopDetectorConfig};
use diagnostics::project::ScanConfig;
use diagnostics::traceback::{parse_traceback, Diagnosis};
use tracing::{debug, info, warn};

use crate::completion::ChatMessage;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::fixer::parse_fix_response;
use crate::prompts::{FixPrompt, FIX_SYSTEM_PREAMBLE};
use crate::session::{AttemptRecord, Collaborators, FailureRecord, SessionReport, SessionRequest};
use crate::workspace::Workspace;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub enable_retrieval: bool,
    /// Hits requested from the knowledge retriever
    pub retrieval_top_k: usize,
    /// Hits kept in the prompt after compression
    pub knowledge_keep: usize,
    pub knowledge_chars: usize,
    pub budget: TokenBudget,
    pub loop_detection: LoopDetectorConfig,
    pub scan: ScanConfig,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            enable_retrieval: true,
            retrieval_top_k: 10,
            knowledge_keep: 3,
            knowledge_chars: 500,
            budget: TokenBudget::default(),
            loop_detection: LoopDetectorConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            enable_retrieval: config.debug.enable_retrieval,
            budget: config.budget.clone(),
            loop_detection: config.loop_detection.clone(),
            scan: config.scan.clone(),
            ..Self::default()
        }
    }
}

pub struct Supervisor {
    collaborators: Collaborators,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(collaborators: Collaborators, settings: SupervisorSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }

    /// Run one session: up to `request.budget + 1` fix attempts.
    ///
    /// Only invalid input is returned as an error. Everything else ends in
    /// a report, with the original source when no attempt verified.
    pub async fn run(&self, request: &SessionRequest) -> AgentResult<SessionReport> {
        request.validate()?;
        let diagnosis = parse_traceback(&request.failure_report);
        let workspace = Workspace::open(request, &diagnosis, &self.settings.scan);
        let max_attempts = request.budget.saturating_add(1);
        info!(
            error_type = %diagnosis.error_type,
            undefined_name = diagnosis.undefined_name().unwrap_or("-"),
            target = %workspace.target(),
            entry_script = %workspace.entry_script(),
            project = workspace.has_project(),
            max_attempts,
            "Starting supervised fix"
        );

        let context = self.assemble_context(&workspace, &diagnosis).await;
        let mut detector = LoopDetector::new(self.settings.loop_detection.clone());
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut failures: Vec<FailureRecord> = Vec::new();

        for attempt_number in 1..=max_attempts {
            let prompt = FixPrompt {
                source: &request.buggy_source,
                diagnosis: &diagnosis,
                failure_report: &request.failure_report,
                context: context.as_deref(),
                failures: &failures,
                guidance: None,
            }
            .render();
            let messages = [ChatMessage::system(FIX_SYSTEM_PREAMBLE), ChatMessage::user(prompt)];

            let response = match self.collaborators.completion.complete(&messages).await {
                Ok(text) => parse_fix_response(&text),
                Err(e) => {
                    warn!(attempt = attempt_number, error = %e, "Fix generation failed");
                    continue;
                }
            };
            let Some(code) = response.fixed_code else {
                warn!(attempt = attempt_number, "Fix response contained no code");
                failures.push(FailureRecord::new(
                    &response.explanation,
                    "the response contained no fixed code section",
                ));
                continue;
            };

            // Gated before verification, so only the code rule can fire.
            let check = detector.check(&Attempt::candidate(code.as_str()));
            if check.is_loop {
                warn!(
                    attempt = attempt_number,
                    loop_type = ?check.loop_type,
                    message = %check.message,
                    "Candidate repeats earlier attempts, stopping retries"
                );
                break;
            }

            let result = self.collaborators.sandbox.run(&workspace.program(&code)).await;
            attempts.push(AttemptRecord::new(
                attempt_number,
                code.clone(),
                response.explanation.clone(),
                result.clone(),
            ));

            if result.success {
                info!(attempt = attempt_number, duration_ms = result.duration_ms, "Fix verified");
                return Ok(SessionReport {
                    success: true,
                    fixed_source: code,
                    explanation: response.explanation,
                    attempt_count: attempts.len(),
                    attempts,
                    loop_detector_summary: detector.summary(),
                    iterations: None,
                    transitions: Vec::new(),
                });
            }

            let error = result.error_text().to_string();
            warn!(
                attempt = attempt_number,
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                "Verification failed"
            );
            failures.push(FailureRecord::new(&response.explanation, &error));
            detector.record_failure(&error);
        }

        Ok(SessionReport {
            success: false,
            fixed_source: request.buggy_source.clone(),
            explanation: format!("No fix passed verification after {} attempt(s)", attempts.len()),
            attempt_count: attempts.len(),
            attempts,
            loop_detector_summary: detector.summary(),
            iterations: None,
            transitions: Vec::new(),
        })
    }

    /// Project context plus retrieved solutions, compressed and rendered.
    ///
    /// Failures here only cost context; the session continues without it.
    async fn assemble_context(&self, workspace: &Workspace, diagnosis: &Diagnosis) -> Option<String> {
        let mut bundle = match workspace.context_for(diagnosis, None) {
            Ok(Some(bundle)) => bundle,
            Ok(None) => ContextBundle::new(),
            Err(e) => {
                warn!(error = %e, "Context assembly failed, continuing with the file alone");
                ContextBundle::new()
            }
        };

        if self.settings.enable_retrieval {
            let query = diagnosis.headline();
            match self
                .collaborators
                .knowledge
                .search(&query, self.settings.retrieval_top_k)
                .await
            {
                Ok(hits) if !hits.is_empty() => {
                    let contents: Vec<String> = hits.into_iter().map(|h| h.content).collect();
                    let kept = compress_knowledge(
                        &contents,
                        self.settings.knowledge_keep,
                        self.settings.knowledge_chars,
                    );
                    debug!(kept = kept.len(), "Knowledge retrieved");
                    bundle.insert(keys::RAG_SOLUTIONS, kept);
                }
                Ok(_) => debug!("No knowledge hits"),
                Err(e) => warn!(error = %e, "Knowledge retrieval failed"),
            }
        }

        if bundle.is_empty() {
            return None;
        }
        let compressor = TokenBudgetCompressor::from_budget(&self.settings.budget);
        Some(compressor.compress(&bundle, self.settings.budget.available()).render())
    }
}
