//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use debug_agents::{
    AgentError, AgentResult, ChatMessage, Collaborators, CompletionService, ExecutionResult,
    KnowledgeHit, KnowledgeRetriever, Program, SandboxExecutor,
};

/// Replies from a fixed script, recording every message list it was sent.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    pub fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Content of the last message of call `n` (0-based).
    pub fn last_message_of_call(&self, n: usize) -> String {
        let calls = self.calls.lock().unwrap();
        calls[n].last().map(|m| m.content.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, messages: &[ChatMessage]) -> AgentResult<String> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Completion("script exhausted".into()))
    }
}

type Judge = dyn Fn(&str, &BTreeMap<String, String>) -> ExecutionResult + Send + Sync;

/// Sandbox whose verdict comes from a closure over the candidate and the
/// other staged files, recording every program it was given.
pub struct JudgedSandbox {
    judge: Box<Judge>,
    pub runs: Mutex<Vec<Program>>,
}

impl JudgedSandbox {
    pub fn new(
        judge: impl Fn(&str, &BTreeMap<String, String>) -> ExecutionResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            judge: Box::new(judge),
            runs: Mutex::new(Vec::new()),
        })
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn program(&self, n: usize) -> Program {
        self.runs.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl SandboxExecutor for JudgedSandbox {
    async fn run(&self, program: &Program) -> ExecutionResult {
        self.runs.lock().unwrap().push(program.clone());
        (self.judge)(program.candidate(), &program.other_files())
    }
}

/// Knowledge base with fixed hits.
pub struct StaticKnowledge(pub Vec<String>);

#[async_trait]
impl KnowledgeRetriever for StaticKnowledge {
    async fn search(&self, _query: &str, top_k: usize) -> AgentResult<Vec<KnowledgeHit>> {
        Ok(self
            .0
            .iter()
            .take(top_k)
            .enumerate()
            .map(|(i, content)| KnowledgeHit {
                content: content.clone(),
                similarity: 1.0 - i as f64 * 0.1,
                rank: i + 1,
            })
            .collect())
    }
}

pub fn passed(stdout: &str) -> ExecutionResult {
    ExecutionResult {
        success: true,
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
        timed_out: false,
        duration_ms: 3,
    }
}

pub fn failed(stderr: &str) -> ExecutionResult {
    ExecutionResult {
        success: false,
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: 1,
        timed_out: false,
        duration_ms: 3,
    }
}

pub fn collaborators(
    completion: &Arc<ScriptedCompletion>,
    sandbox: &Arc<JudgedSandbox>,
    knowledge: Arc<dyn KnowledgeRetriever>,
) -> Collaborators {
    Collaborators::new(completion.clone(), sandbox.clone(), knowledge)
}

/// A single-file fix response in the section format.
pub fn fix_reply(code: &str, explanation: &str) -> String {
    format!(
        "===FIXED_CODE===\n{code}\n===END_CODE===\n===EXPLANATION===\n{explanation}\n===END_EXPLANATION===\n===CHANGES===\n- {explanation}\n===END_CHANGES==="
    )
}

pub fn step(tool: &str, input: &str) -> String {
    format!("Thought: next step\nAction: {tool}\nAction Input: {input}")
}
