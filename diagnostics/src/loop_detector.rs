//! Loop Detector: flag repair attempts that repeat earlier work.
//!
//! Keeps fingerprint counts for candidate code and for error text, plus the
//! ordered attempt history. Rules, first match wins:
//! 1. The same code fingerprint was already recorded `max_similar_code` times.
//! 2. The same error fingerprint was already recorded `max_same_error` times.
//! 3. The current attempt failed and so did the previous `failure_window`
//!    recorded attempts.
//!
//! All rules look at history recorded *before* the current attempt. A flagged
//! attempt is not recorded.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Content hash of normalised code or error text. Only compared, never reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    /// Whitespace-insensitive code fingerprint: lines trimmed, blank lines dropped.
    pub fn of_code(code: &str) -> Option<Self> {
        let normalized = normalize_code(code);
        (!normalized.is_empty()).then(|| Self(blake3::hash(normalized.as_bytes())))
    }

    /// Case-insensitive error fingerprint.
    pub fn of_error(error: &str) -> Option<Self> {
        let normalized = error.trim().to_lowercase();
        (!normalized.is_empty()).then(|| Self(blake3::hash(normalized.as_bytes())))
    }

    /// Short hex form for logs.
    pub fn short(&self) -> String {
        self.0.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

fn normalize_code(code: &str) -> String {
    code.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Thresholds for the three rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    pub max_similar_code: usize,
    pub max_same_error: usize,
    pub failure_window: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            max_similar_code: 2,
            max_same_error: 3,
            failure_window: 3,
        }
    }
}

/// One repair attempt as seen by the detector.
#[derive(Debug, Clone, Default)]
pub struct Attempt {
    pub code: Option<String>,
    pub error: Option<String>,
}

impl Attempt {
    /// A candidate that has not been verified yet.
    pub fn candidate(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            error: None,
        }
    }

    /// A candidate together with the error it produced.
    pub fn failed(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            error: Some(error.into()),
        }
    }

    /// A verification failure reported without the code (already recorded).
    pub fn error_only(error: impl Into<String>) -> Self {
        Self {
            code: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Code,
    Error,
    FailurePattern,
}

impl fmt::Display for LoopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code => write!(f, "code"),
            Self::Error => write!(f, "error"),
            Self::FailurePattern => write!(f, "failure_pattern"),
        }
    }
}

/// Outcome of [`LoopDetector::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCheck {
    pub is_loop: bool,
    pub loop_type: Option<LoopType>,
    pub message: String,
    pub suggestion: String,
}

impl LoopCheck {
    fn clear() -> Self {
        Self {
            is_loop: false,
            loop_type: None,
            message: String::new(),
            suggestion: String::new(),
        }
    }

    fn detected(loop_type: LoopType, message: String, suggestion: &str) -> Self {
        Self {
            is_loop: true,
            loop_type: Some(loop_type),
            message,
            suggestion: suggestion.to_string(),
        }
    }

    /// Text injected into a transcript or prompt when a loop is flagged.
    pub fn warning(&self) -> String {
        format!("WARNING: {}\nSuggestion: {}", self.message, self.suggestion)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStats {
    pub total_attempts: usize,
    pub code_loops_detected: usize,
    pub error_loops_detected: usize,
    pub failure_patterns_detected: usize,
}

/// A recorded attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub code_fingerprint: Option<String>,
    pub error_fingerprint: Option<String>,
    /// First line of the error, if any
    pub error_excerpt: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn failed(&self) -> bool {
        self.error_fingerprint.is_some()
    }
}

/// Serializable snapshot returned with every session result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSummary {
    pub stats: LoopStats,
    pub distinct_code_fingerprints: usize,
    pub distinct_error_fingerprints: usize,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    code_counts: HashMap<Fingerprint, usize>,
    error_counts: HashMap<Fingerprint, usize>,
    history: Vec<HistoryEntry>,
    stats: LoopStats,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    /// Classify an attempt, recording it when it is not a loop.
    pub fn check(&mut self, attempt: &Attempt) -> LoopCheck {
        let code_fp = attempt.code.as_deref().and_then(Fingerprint::of_code);
        let error_fp = attempt.error.as_deref().and_then(Fingerprint::of_error);

        if let Some(fp) = code_fp {
            let seen = self.code_counts.get(&fp).copied().unwrap_or(0);
            if seen >= self.config.max_similar_code {
                self.stats.code_loops_detected += 1;
                warn!(fingerprint = %fp, seen, "Code loop detected");
                return LoopCheck::detected(
                    LoopType::Code,
                    format!("Generated code is identical to {seen} previous attempt(s)"),
                    "Try a fundamentally different approach; reconsider the root cause of the error",
                );
            }
        }

        if let Some(fp) = error_fp {
            let seen = self.error_counts.get(&fp).copied().unwrap_or(0);
            if seen >= self.config.max_same_error {
                self.stats.error_loops_detected += 1;
                warn!(fingerprint = %fp, seen, "Error loop detected");
                return LoopCheck::detected(
                    LoopType::Error,
                    format!("The same error has already occurred {seen} times"),
                    "The current approach does not address the root cause; re-read the traceback",
                );
            }
        }

        let window = self.config.failure_window;
        if error_fp.is_some()
            && window > 0
            && self.history.len() >= window
            && self.history[self.history.len() - window..]
                .iter()
                .all(HistoryEntry::failed)
        {
            self.stats.failure_patterns_detected += 1;
            warn!(window, "Consecutive failure pattern detected");
            return LoopCheck::detected(
                LoopType::FailurePattern,
                format!("The last {} attempts all failed", window + 1),
                "Gather more context (project files, imports, definitions) before proposing another fix",
            );
        }

        if let Some(fp) = code_fp {
            *self.code_counts.entry(fp).or_insert(0) += 1;
        }
        if let Some(fp) = error_fp {
            *self.error_counts.entry(fp).or_insert(0) += 1;
        }
        self.history.push(HistoryEntry {
            code_fingerprint: code_fp.map(|f| f.short()),
            error_fingerprint: error_fp.map(|f| f.short()),
            error_excerpt: attempt
                .error
                .as_deref()
                .and_then(|e| e.trim().lines().last())
                .map(String::from),
            recorded_at: Utc::now(),
        });
        self.stats.total_attempts += 1;

        LoopCheck::clear()
    }

    /// Attach a verification error to the most recently recorded attempt.
    ///
    /// Only updates history and error counts; no rule is evaluated. Callers
    /// that gate candidates before running them use this so the outcome is
    /// still reflected in the summary. Without a recorded attempt, or when the
    /// last attempt already carries an error, the error becomes its own entry.
    pub fn record_failure(&mut self, error: &str) {
        let Some(fp) = Fingerprint::of_error(error) else {
            return;
        };
        *self.error_counts.entry(fp).or_insert(0) += 1;
        let excerpt = error.trim().lines().last().map(String::from);
        match self.history.last_mut() {
            Some(entry) if entry.error_fingerprint.is_none() => {
                entry.error_fingerprint = Some(fp.short());
                entry.error_excerpt = excerpt;
            }
            _ => {
                self.history.push(HistoryEntry {
                    code_fingerprint: None,
                    error_fingerprint: Some(fp.short()),
                    error_excerpt: excerpt,
                    recorded_at: Utc::now(),
                });
                self.stats.total_attempts += 1;
            }
        }
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Human-readable digest of the last five recorded attempts.
    pub fn history_summary(&self) -> String {
        if self.history.is_empty() {
            return "No attempts recorded.".to_string();
        }
        let skip = self.history.len().saturating_sub(5);
        self.history
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, entry)| {
                let code = entry.code_fingerprint.as_deref().unwrap_or("-");
                match &entry.error_excerpt {
                    Some(err) => format!("Attempt {}: code {code}, failed: {err}", i + 1),
                    None => format!("Attempt {}: code {code}", i + 1),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn summary(&self) -> LoopSummary {
        LoopSummary {
            stats: self.stats.clone(),
            distinct_code_fingerprints: self.code_counts.len(),
            distinct_error_fingerprints: self.error_counts.len(),
            history: self.history.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.code_counts.clear();
        self.error_counts.clear();
        self.history.clear();
        self.stats = LoopStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_loop_flags_on_third_occurrence() {
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());
        let code = "def f():\n    return 1\n";

        assert!(!detector.check(&Attempt::candidate(code)).is_loop);
        // Whitespace differences do not matter.
        assert!(!detector.check(&Attempt::candidate("  def f():\n\n  return 1")).is_loop);

        let third = detector.check(&Attempt::candidate(code));
        assert!(third.is_loop);
        assert_eq!(third.loop_type, Some(LoopType::Code));
        assert_eq!(detector.stats().code_loops_detected, 1);
        assert_eq!(detector.stats().total_attempts, 2);
    }

    #[test]
    fn test_flagged_attempt_is_not_recorded() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            max_similar_code: 1,
            ..LoopDetectorConfig::default()
        });
        detector.check(&Attempt::candidate("x = 1"));
        assert!(detector.check(&Attempt::candidate("x = 1")).is_loop);
        assert!(detector.check(&Attempt::candidate("x = 1")).is_loop);
        assert_eq!(detector.history().len(), 1);
    }

    #[test]
    fn test_record_failure_attaches_to_last_attempt() {
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());
        for i in 0..6 {
            assert!(!detector.check(&Attempt::candidate(format!("v{i}()"))).is_loop);
            detector.record_failure("TypeError: unsupported operand");
        }
        assert_eq!(detector.history().len(), 6);
        assert!(detector.history().iter().all(|h| h.error_fingerprint.is_some()));
        assert_eq!(detector.stats().total_attempts, 6);
        assert_eq!(detector.stats().error_loops_detected, 0);
        assert_eq!(detector.stats().failure_patterns_detected, 0);
        assert_eq!(detector.summary().distinct_error_fingerprints, 1);

        // Nothing to attach to: the error is its own entry.
        let mut fresh = LoopDetector::new(LoopDetectorConfig::default());
        fresh.record_failure("boom");
        fresh.record_failure("   ");
        assert_eq!(fresh.history().len(), 1);
        assert_eq!(fresh.history()[0].code_fingerprint, None);
    }

    #[test]
    fn test_error_loop() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            failure_window: 0,
            ..LoopDetectorConfig::default()
        });
        for i in 0..3 {
            let check = detector.check(&Attempt::failed(format!("x = {i}"), "NameError: y"));
            assert!(!check.is_loop, "attempt {i}");
        }
        let check = detector.check(&Attempt::failed("x = 99", "  nameerror: Y  "));
        assert_eq!(check.loop_type, Some(LoopType::Error));
    }

    #[test]
    fn test_failure_pattern() {
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());
        for i in 0..3 {
            let check = detector.check(&Attempt::failed(format!("v{i}()"), format!("Error {i}")));
            assert!(!check.is_loop);
        }
        let check = detector.check(&Attempt::failed("v3()", "Error 3"));
        assert_eq!(check.loop_type, Some(LoopType::FailurePattern));
        assert!(check.warning().starts_with("WARNING: The last 4 attempts"));

        // A passing attempt breaks the window.
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());
        detector.check(&Attempt::failed("a()", "E1"));
        detector.check(&Attempt::candidate("b()"));
        detector.check(&Attempt::failed("c()", "E2"));
        detector.check(&Attempt::failed("d()", "E3"));
        assert!(!detector.check(&Attempt::failed("e()", "E4")).is_loop);
    }

    #[test]
    fn test_summary_and_reset() {
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());
        detector.check(&Attempt::failed("a()", "Traceback...\nNameError: name 'a' is not defined"));
        detector.check(&Attempt::candidate("b()"));

        let text = detector.history_summary();
        assert!(text.contains("Attempt 1"));
        assert!(text.contains("NameError: name 'a' is not defined"));

        let summary = detector.summary();
        assert_eq!(summary.distinct_code_fingerprints, 2);
        assert_eq!(summary.distinct_error_fingerprints, 1);
        assert!(serde_json::to_value(&summary).is_ok());

        detector.reset();
        assert_eq!(detector.stats(), &LoopStats::default());
        assert_eq!(detector.history_summary(), "No attempts recorded.");
    }

    #[test]
    fn test_empty_code_is_ignored() {
        let mut detector = LoopDetector::new(LoopDetectorConfig::default());
        for _ in 0..5 {
            assert!(!detector.check(&Attempt::candidate("   \n\n")).is_loop);
        }
    }
}
