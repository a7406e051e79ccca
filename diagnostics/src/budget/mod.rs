//! Token budgeting for prompt context.

pub mod compressor;
pub mod estimator;

pub use compressor::{
    compress_related_files, compress_knowledge, key_priority, truncate_chars, CompressionReport,
    TokenBudgetCompressor, TRUNCATION_MARKER,
};
pub use estimator::{CharCountEstimator, TokenBudget, TokenEstimator};
