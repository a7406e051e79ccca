//! Diagnostics Library
//!
//! Deterministic building blocks for automated Python debugging:
//! - Project scan: symbol index and import graph over a source tree
//! - Context assembly for an error site (file, line, error type, name)
//! - Token budget compression of assembled context
//! - Loop detection over repeated fix attempts
//! - Traceback parsing
//! - Sandboxed execution of candidate fixes
//!
//! Nothing here talks to a language model. The agent layer in
//! `debug-agents` drives these pieces.
//!
//! # Usage
//!
//! ```no_run
//! use diagnostics::context::ContextAssembler;
//! use diagnostics::project::ScanConfig;
//!
//! let assembler = ContextAssembler::from_root("./my_project", &ScanConfig::default())?;
//! let bundle =
//!     assembler.get_context_for_error("main.py", Some(3), "NameError", Some("calculate"))?;
//! println!("{}", bundle.render());
//! # Ok::<(), diagnostics::DiagnosticsError>(())
//! ```

pub mod budget;
pub mod context;
pub mod error;
pub mod loop_detector;
pub mod project;
pub mod sandbox;
pub mod traceback;

pub use budget::{CharCountEstimator, TokenBudget, TokenBudgetCompressor, TokenEstimator};
pub use context::{ContextAssembler, ContextBundle, ContextQuery};
pub use error::{DiagnosticsError, DiagnosticsResult};
pub use loop_detector::{Attempt, LoopCheck, LoopDetector, LoopDetectorConfig, LoopType};
pub use project::{scan, ProjectIndex, ScanConfig};
pub use sandbox::{ExecutionResult, LocalSandbox, Program, SandboxExecutor};
pub use traceback::{parse_traceback, Diagnosis, MissingName};
