//! Token Budget Compressor: fit a context bundle into a prompt budget.
//!
//! Keys are visited in a fixed priority order (the failing file first,
//! loosely related files last). Each key is kept whole if it fits, truncated
//! if at least `min_truncation_tokens` remain, and dropped otherwise. This is
//! a greedy approximation of the knapsack problem; it is not optimal but
//! runs in O(n log n) over the keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::estimator::{CharCountEstimator, TokenBudget, TokenEstimator};
use crate::context::{keys, ContextBundle};

/// Appended wherever text was cut.
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Cut at the last newline when it falls beyond this fraction of the limit.
const NEWLINE_CUT_RATIO: f64 = 0.7;

/// Minimum remaining tokens for truncating an entry inside a mapping.
const MIN_ENTRY_TOKENS: u64 = 15;

/// Priority of a bundle key; lower is more load-bearing. Unknown keys sort last.
pub fn key_priority(key: &str) -> u8 {
    match key {
        keys::ERROR_FILE_CONTENT => 1,
        keys::ERROR_MESSAGE => 2,
        keys::RELATED_SYMBOLS => 3,
        keys::IMPORT_SUGGESTIONS => 4,
        keys::CANDIDATE_SYMBOLS => 5,
        keys::CIRCULAR_IMPORTS => 6,
        keys::RAG_SOLUTIONS => 7,
        keys::RELATED_FILES => 8,
        _ => 99,
    }
}

/// What a compression pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionReport {
    pub budget: u64,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    pub truncated_keys: Vec<String>,
    pub dropped_keys: Vec<String>,
}

impl CompressionReport {
    pub fn was_compressed(&self) -> bool {
        !self.truncated_keys.is_empty() || !self.dropped_keys.is_empty()
    }
}

/// Greedy, priority-ordered bundle compressor.
pub struct TokenBudgetCompressor<E: TokenEstimator = CharCountEstimator> {
    estimator: E,
    min_truncation_tokens: u64,
}

impl TokenBudgetCompressor<CharCountEstimator> {
    /// Compressor using the budget's chars-per-token ratio and truncation floor.
    pub fn from_budget(budget: &TokenBudget) -> Self {
        Self::new(budget.estimator(), budget.min_truncation_tokens)
    }
}

impl Default for TokenBudgetCompressor<CharCountEstimator> {
    fn default() -> Self {
        Self::from_budget(&TokenBudget::default())
    }
}

impl<E: TokenEstimator> TokenBudgetCompressor<E> {
    pub fn new(estimator: E, min_truncation_tokens: u64) -> Self {
        Self {
            estimator,
            min_truncation_tokens,
        }
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    /// Estimated size of a whole bundle.
    pub fn estimate(&self, bundle: &ContextBundle) -> u64 {
        bundle
            .iter()
            .map(|(_, v)| self.estimator.estimate_value(v))
            .sum()
    }

    /// Fit `bundle` into `budget` tokens.
    ///
    /// A bundle already within budget is returned unchanged (same keys, same
    /// order). Otherwise the result is in priority order and its estimate is
    /// at most `budget`.
    pub fn compress(&self, bundle: &ContextBundle, budget: u64) -> ContextBundle {
        self.compress_with_report(bundle, budget).0
    }

    pub fn compress_with_report(
        &self,
        bundle: &ContextBundle,
        budget: u64,
    ) -> (ContextBundle, CompressionReport) {
        let original_tokens = self.estimate(bundle);
        let mut report = CompressionReport {
            budget,
            original_tokens,
            compressed_tokens: original_tokens,
            ..CompressionReport::default()
        };
        if original_tokens <= budget {
            return (bundle.clone(), report);
        }

        // Stable sort keeps unknown keys in their original relative order.
        let mut ordered: Vec<(&str, &Value)> = bundle.iter().collect();
        ordered.sort_by_key(|(k, _)| key_priority(k));

        let mut remaining = budget;
        let mut out = ContextBundle::new();
        for (key, value) in ordered {
            let size = self.estimator.estimate_value(value);
            if size <= remaining {
                out.insert(key, value.clone());
                remaining -= size;
                continue;
            }

            if remaining >= self.min_truncation_tokens {
                if let Some(truncated) = self.truncate_value(value, remaining) {
                    let truncated_size = self.estimator.estimate_value(&truncated);
                    if truncated_size <= remaining {
                        out.insert(key, truncated);
                        remaining -= truncated_size;
                        report.truncated_keys.push(key.to_string());
                        continue;
                    }
                }
            }
            report.dropped_keys.push(key.to_string());
        }

        report.compressed_tokens = budget - remaining;
        debug!(
            budget,
            original = report.original_tokens,
            compressed = report.compressed_tokens,
            truncated = ?report.truncated_keys,
            dropped = ?report.dropped_keys,
            "Compressed context bundle"
        );
        (out, report)
    }

    /// Shrink a value to at most `max_tokens`. `None` if nothing useful fits.
    fn truncate_value(&self, value: &Value, max_tokens: u64) -> Option<Value> {
        match value {
            Value::Null => Some(Value::Null),
            Value::String(s) => self.truncate_text(s, max_tokens).map(Value::String),
            Value::Bool(_) | Value::Number(_) => {
                (self.estimator.estimate_value(value) <= max_tokens).then(|| value.clone())
            }
            Value::Array(items) => {
                let mut remaining = max_tokens;
                let mut kept = Vec::new();
                for item in items {
                    let size = self.estimator.estimate_value(item);
                    if size > remaining {
                        break;
                    }
                    remaining -= size;
                    kept.push(item.clone());
                }
                (!kept.is_empty()).then_some(Value::Array(kept))
            }
            Value::Object(map) => {
                let mut remaining = max_tokens;
                let mut kept = Map::new();
                for (k, v) in map {
                    let size = self.estimator.estimate_value(v);
                    if size <= remaining {
                        remaining -= size;
                        kept.insert(k.clone(), v.clone());
                        continue;
                    }
                    if remaining >= MIN_ENTRY_TOKENS {
                        if let Some(t) = self.truncate_value(v, remaining) {
                            kept.insert(k.clone(), t);
                        }
                    }
                    break;
                }
                (!kept.is_empty()).then_some(Value::Object(kept))
            }
        }
    }

    /// Longest prefix of `text` that, with the marker appended, fits in
    /// `max_tokens`. Prefers cutting at a newline.
    pub fn truncate_text(&self, text: &str, max_tokens: u64) -> Option<String> {
        if u64::from(self.estimator.estimate(text)) <= max_tokens {
            return Some(text.to_string());
        }
        if u64::from(self.estimator.estimate(TRUNCATION_MARKER)) > max_tokens {
            return None;
        }

        let bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let fits = |cut: usize| {
            let candidate = format!("{}{}", &text[..cut], TRUNCATION_MARKER);
            u64::from(self.estimator.estimate(&candidate)) <= max_tokens
        };

        // Binary search for the last boundary that fits.
        let (mut lo, mut hi) = (0usize, bounds.len());
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if mid < bounds.len() && fits(bounds[mid]) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let mut cut = bounds.get(lo).copied().unwrap_or(0);
        if cut == 0 {
            return None;
        }
        if let Some(newline) = text[..cut].rfind('\n') {
            if newline as f64 > cut as f64 * NEWLINE_CUT_RATIO {
                cut = newline;
            }
        }

        Some(format!("{}{}", &text[..cut], TRUNCATION_MARKER))
    }
}

/// Cut `text` to at most `max_chars` bytes (plus marker), preferring a newline.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut cut = max_chars;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    if let Some(newline) = text[..cut].rfind('\n') {
        if newline as f64 > cut as f64 * NEWLINE_CUT_RATIO {
            cut = newline;
        }
    }
    format!("{}{}", &text[..cut], TRUNCATION_MARKER)
}

/// Keep the first `max_items` retrieved snippets, each cut to `max_chars`.
pub fn compress_knowledge(snippets: &[String], max_items: usize, max_chars: usize) -> Vec<String> {
    snippets
        .iter()
        .take(max_items)
        .map(|s| truncate_chars(s, max_chars))
        .collect()
}

/// Keep the `max_files` smallest files, each cut to `max_chars`.
pub fn compress_related_files(
    files: &BTreeMap<String, String>,
    max_files: usize,
    max_chars: usize,
) -> BTreeMap<String, String> {
    let mut by_size: Vec<(&String, &String)> = files.iter().collect();
    by_size.sort_by_key(|(name, content)| (content.len(), name.as_str()));
    by_size
        .into_iter()
        .take(max_files)
        .map(|(name, content)| (name.clone(), truncate_chars(content, max_chars)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compressor() -> TokenBudgetCompressor {
        TokenBudgetCompressor::new(CharCountEstimator::new(1.0), 10)
    }

    #[test]
    fn test_within_budget_is_noop() {
        let bundle = ContextBundle::new()
            .with(keys::RELATED_FILES, json!({"a.py": "x = 1"}))
            .with(keys::ERROR_FILE_CONTENT, "print(x)");
        let c = compressor();
        let out = c.compress(&bundle, 1_000);
        assert_eq!(out, bundle);
        // Order untouched even though it is not priority order.
        assert_eq!(out.keys().next(), Some(keys::RELATED_FILES));
    }

    #[test]
    fn test_over_budget_fits() {
        let big = "line of code\n".repeat(50); // 650 chars
        let bundle = ContextBundle::new()
            .with(keys::RELATED_FILES, json!({"a.py": big.clone(), "b.py": big.clone()}))
            .with("custom_notes", "z".repeat(40))
            .with(keys::IMPORT_SUGGESTIONS, json!(["from a import f"]))
            .with(keys::ERROR_FILE_CONTENT, big.clone());

        let c = compressor();
        for budget in [20u64, 100, 300, 700, 1_000, 1_500] {
            let (out, report) = c.compress_with_report(&bundle, budget);
            assert!(
                c.estimate(&out) <= budget,
                "budget {budget}: got {}",
                c.estimate(&out)
            );
            assert_eq!(report.compressed_tokens, c.estimate(&out));
            assert!(report.was_compressed());
        }
    }

    #[test]
    fn test_priority_order_and_truncation() {
        let content = "a\n".repeat(100); // 200 chars
        let bundle = ContextBundle::new()
            .with("unknown_a", "u".repeat(5))
            .with(keys::RELATED_FILES, json!({"x.py": "y".repeat(500)}))
            .with(keys::IMPORT_SUGGESTIONS, json!(["from m import n"]))
            .with(keys::ERROR_FILE_CONTENT, content);

        let c = compressor();
        let (out, report) = c.compress_with_report(&bundle, 120);

        let order: Vec<&str> = out.keys().collect();
        assert_eq!(order[0], keys::ERROR_FILE_CONTENT);
        assert_eq!(report.truncated_keys, vec![keys::ERROR_FILE_CONTENT]);

        let text = out.get(keys::ERROR_FILE_CONTENT).unwrap().as_str().unwrap();
        assert!(text.ends_with(TRUNCATION_MARKER));
        // Cut lands on a newline boundary.
        assert!(text.trim_end_matches(TRUNCATION_MARKER).ends_with('a'));
        assert!(report.dropped_keys.contains(&keys::RELATED_FILES.to_string()));
    }

    #[test]
    fn test_below_floor_drops() {
        let bundle = ContextBundle::new().with(keys::ERROR_FILE_CONTENT, "x".repeat(100));
        let c = TokenBudgetCompressor::new(CharCountEstimator::new(1.0), 50);
        let (out, report) = c.compress_with_report(&bundle, 40);
        assert!(out.is_empty());
        assert_eq!(report.dropped_keys, vec![keys::ERROR_FILE_CONTENT]);
    }

    #[test]
    fn test_unknown_keys_keep_relative_order() {
        let bundle = ContextBundle::new()
            .with("zeta", "1".repeat(10))
            .with("alpha", "2".repeat(10))
            .with(keys::ERROR_FILE_CONTENT, "3".repeat(10))
            .with("huge", "4".repeat(1_000));
        let out = compressor().compress(&bundle, 40);
        let order: Vec<&str> = out.keys().collect();
        assert_eq!(order, vec![keys::ERROR_FILE_CONTENT, "zeta", "alpha"]);
    }

    #[test]
    fn test_truncate_text_multibyte() {
        let c = compressor();
        let text = "é".repeat(100); // 200 bytes
        let out = c.truncate_text(&text, 50).unwrap();
        assert!(out.len() <= 50);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_helpers() {
        let snippets: Vec<String> = (0..5).map(|i| format!("{i}").repeat(600)).collect();
        let out = compress_knowledge(&snippets, 3, 500);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|s| s.len() <= 500 + TRUNCATION_MARKER.len()));

        let mut files = BTreeMap::new();
        files.insert("big.py".to_string(), "b".repeat(5_000));
        files.insert("mid.py".to_string(), "m".repeat(50));
        files.insert("small.py".to_string(), "s".repeat(10));
        files.insert("tiny.py".to_string(), "t".repeat(1));
        let out = compress_related_files(&files, 3, 1_000);
        assert_eq!(
            out.keys().collect::<Vec<_>>(),
            vec!["mid.py", "small.py", "tiny.py"]
        );
    }
}
