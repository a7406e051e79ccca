//! Error-site context: what the model needs to see to repair one failure.

pub mod assembler;
pub mod bundle;
pub mod fuzzy;

pub use assembler::{ContextAssembler, ContextQuery};
pub use bundle::{keys, ContextBundle};
pub use fuzzy::{close_matches, similarity};
