//! Orchestration State Machine: explicit states and a typed transition function.
//!
//! The think/act/observe loop is driven by events (collaborator responses)
//! rather than by control flow alone, so that:
//! 1. Every transition is auditable and logged.
//! 2. Illegal transitions are rejected by `transition()`.
//! 3. A session's transition log can be replayed offline.
//!
//! ```text
//! Thinking  --StepParsed-->          Acting
//! Thinking  --StepRejected-->        Observing
//! Thinking  --FinalAccepted-->       Done
//! Acting    --ToolFinished-->        Observing
//! Observing --ObservationRecorded--> Thinking
//! (any non-terminal) --BudgetExhausted--> Failed
//! ```

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Loop states. Every session starts at `Thinking` and ends at `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting for the model's next step.
    Thinking,
    /// Executing a tool call.
    Acting,
    /// Appending an observation to the transcript.
    Observing,
    /// Verified fix accepted (terminal).
    Done,
    /// Iteration budget exhausted (terminal).
    Failed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thinking => write!(f, "Thinking"),
            Self::Acting => write!(f, "Acting"),
            Self::Observing => write!(f, "Observing"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// What happened since the last transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopEvent {
    /// The model named a known tool with valid arguments.
    StepParsed,
    /// Unparsable output, unknown tool, unverified final answer or failed completion.
    StepRejected,
    /// A final answer naming a verified fix.
    FinalAccepted,
    ToolFinished,
    ObservationRecorded,
    BudgetExhausted,
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StepParsed => "step_parsed",
            Self::StepRejected => "step_rejected",
            Self::FinalAccepted => "final_accepted",
            Self::ToolFinished => "tool_finished",
            Self::ObservationRecorded => "observation_recorded",
            Self::BudgetExhausted => "budget_exhausted",
        };
        f.write_str(name)
    }
}

/// Error returned when an event is not legal in the current state.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: LoopState,
    pub event: LoopEvent,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} on {}", self.from, self.event)
    }
}

impl std::error::Error for IllegalTransition {}

/// The transition function `(state, event) -> state'`.
pub fn transition(from: LoopState, event: LoopEvent) -> Result<LoopState, IllegalTransition> {
    use LoopEvent::*;
    use LoopState::*;

    let to = match (from, event) {
        (state, BudgetExhausted) if !state.is_terminal() => Failed,
        (Thinking, StepParsed) => Acting,
        (Thinking, StepRejected) => Observing,
        (Thinking, FinalAccepted) => Done,
        (Acting, ToolFinished) => Observing,
        (Observing, ObservationRecorded) => Thinking,
        _ => return Err(IllegalTransition { from, event }),
    };
    Ok(to)
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: LoopState,
    pub to: LoopState,
    pub event: LoopEvent,
    /// Iteration number at the time of transition (1-based).
    pub iteration: u32,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Tracks the current state and the full transition log of one session.
pub struct StateMachine {
    current: LoopState,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: LoopState::Thinking,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> LoopState {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Apply `event`, recording the transition when it is legal.
    pub fn apply(
        &mut self,
        event: LoopEvent,
        reason: Option<&str>,
    ) -> Result<LoopState, IllegalTransition> {
        let to = transition(self.current, event)?;

        tracing::debug!(
            from = %self.current,
            to = %to,
            event = %event,
            iteration = self.iteration,
            "State transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            event,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(to)
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }

    /// Summary of the state machine's history.
    pub fn summary(&self) -> String {
        format!(
            "{} → {} ({}ms, {} transitions, {} iterations)",
            LoopState::Thinking,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
            self.iteration,
        )
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
