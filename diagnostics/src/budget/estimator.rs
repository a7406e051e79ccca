//! Token estimation: pluggable estimator and prompt budget configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Converts text into an approximate token count.
pub trait TokenEstimator {
    /// Approximate tokens in `text`.
    fn estimate(&self, text: &str) -> u32;

    /// Short identifier, used in log fields.
    fn name(&self) -> &str;

    /// Estimate a JSON value: strings by their text, numbers and booleans by
    /// their rendering, containers as the sum of their values.
    fn estimate_value(&self, value: &Value) -> u64 {
        match value {
            Value::Null => 0,
            Value::String(s) => u64::from(self.estimate(s)),
            Value::Bool(_) | Value::Number(_) => u64::from(self.estimate(&value.to_string())),
            Value::Array(items) => items.iter().map(|v| self.estimate_value(v)).sum(),
            Value::Object(map) => map.values().map(|v| self.estimate_value(v)).sum(),
        }
    }
}

/// Divides the byte length by a fixed characters-per-token ratio, rounding up.
///
/// Code is denser than prose; 3.5 characters per token is the default.
#[derive(Debug, Clone)]
pub struct CharCountEstimator {
    /// Characters per token.
    pub chars_per_token: f64,
}

impl CharCountEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }
}

impl Default for CharCountEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 3.5,
        }
    }
}

impl TokenEstimator for CharCountEstimator {
    fn estimate(&self, text: &str) -> u32 {
        (text.len() as f64 / self.chars_per_token).ceil() as u32
    }

    fn name(&self) -> &str {
        "char_count"
    }
}

/// Prompt budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudget {
    /// Total context window available for one request.
    pub max_context_tokens: u64,
    /// Reserved for the system prompt, instructions and the response.
    pub reserve_tokens: u64,
    pub chars_per_token: f64,
    /// Below this many remaining tokens a key is dropped rather than truncated.
    pub min_truncation_tokens: u64,
}

impl TokenBudget {
    /// Available budget for context (max - reserve).
    pub fn available(&self) -> u64 {
        self.max_context_tokens.saturating_sub(self.reserve_tokens)
    }

    pub fn estimator(&self) -> CharCountEstimator {
        CharCountEstimator::new(self.chars_per_token)
    }

    /// Rejects budgets that leave no room for context.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_context_tokens == 0 {
            return Err("max_context_tokens must be positive".to_string());
        }
        if self.reserve_tokens >= self.max_context_tokens {
            return Err(format!(
                "reserve_tokens ({}) must be less than max_context_tokens ({})",
                self.reserve_tokens, self.max_context_tokens
            ));
        }
        if !(self.chars_per_token.is_finite() && self.chars_per_token > 0.0) {
            return Err(format!(
                "chars_per_token must be a positive number, got {}",
                self.chars_per_token
            ));
        }
        Ok(())
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_context_tokens: 6_000,
            reserve_tokens: 2_000,
            chars_per_token: 3.5,
            min_truncation_tokens: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_char_count_estimator() {
        let est = CharCountEstimator::default();
        assert_eq!(est.estimate("hello world"), 4); // 11 / 3.5 = 3.14 → 4
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.name(), "char_count");
    }

    #[test]
    fn test_estimate_value_sums_children() {
        let est = CharCountEstimator::new(1.0);
        let value = json!({
            "a": "abcd",
            "b": ["xy", "z"],
            "c": {"d": 12345},
            "e": null,
            "f": true,
        });
        assert_eq!(est.estimate_value(&value), 4 + 2 + 1 + 5 + 4);
    }

    #[test]
    fn test_budget_defaults() {
        let budget = TokenBudget::default();
        assert_eq!(budget.available(), 4_000);
        assert!(budget.validate().is_ok());
    }

    #[test]
    fn test_budget_validate() {
        let mut budget = TokenBudget {
            reserve_tokens: 6_000,
            ..TokenBudget::default()
        };
        assert!(budget.validate().is_err());

        budget.reserve_tokens = 100;
        budget.chars_per_token = 0.0;
        assert!(budget.validate().is_err());
    }
}
