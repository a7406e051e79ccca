//! Debugging agents for Python failures.
//!
//! Two control flows share one set of collaborators
//! ([`CompletionService`], [`SandboxExecutor`], [`KnowledgeRetriever`]):
//!
//! - [`Supervisor`]: single-shot fix requests, verified and retried against
//!   the original source with a growing failure history.
//! - [`OrchestrationLoop`]: a think/act/observe loop where the model picks
//!   tools until it names a verified fix.
//!
//! Deterministic analysis (project scan, context assembly, compression, loop
//! detection, sandboxing) lives in the `diagnostics` crate.

pub mod action;
pub mod completion;
pub mod config;
pub mod error;
pub mod fixer;
pub mod knowledge;
pub mod orchestrator;
pub mod prompts;
pub mod session;
pub mod state_machine;
pub mod supervisor;
pub mod workspace;

pub use action::{parse_step, Action, FinalAnswer, ParseOutcome, ToolName};
pub use completion::{ChatMessage, CompletionService, OpenAiCompletionClient, Role};
pub use config::AgentConfig;
pub use diagnostics::sandbox::{ExecutionResult, LocalSandbox, Program, SandboxExecutor};
pub use error::{AgentError, AgentResult};
pub use knowledge::{KeywordKnowledgeBase, KnowledgeHit, KnowledgeRetriever, NoKnowledge};
pub use orchestrator::{LoopSettings, OrchestrationLoop};
pub use session::{AttemptRecord, Collaborators, FailureRecord, SessionReport, SessionRequest};
pub use state_machine::{LoopEvent, LoopState, StateMachine, TransitionRecord};
pub use supervisor::{Supervisor, SupervisorSettings};
