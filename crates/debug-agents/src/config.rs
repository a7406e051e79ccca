use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use diagnostics::budget::TokenBudget;
use diagnostics::loop_detector::LoopDetectorConfig;
use diagnostics::project::ScanConfig;
use serde::Deserialize;
use tracing::debug;

/// Config file names looked up in the project root, in order.
pub const CONFIG_FILE_NAMES: [&str; 2] = [".debugagent.toml", "debugagent.toml"];

/// OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL, e.g. `http://localhost:8080/v1`
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DEBUGAGENT_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:8080/v1".into()),
            model: std::env::var("DEBUGAGENT_LLM_MODEL")
                .unwrap_or_else(|_| "qwen2.5-coder-14b-instruct".into()),
            api_key: std::env::var("DEBUGAGENT_LLM_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            temperature: 0.3,
            max_tokens: 2000,
            timeout_secs: 300,
        }
    }
}

/// Session budgets and collaborator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Supervisor: retries after the first attempt.
    pub max_retries: u32,
    /// Orchestration loop: think/act/observe iterations.
    pub max_iterations: u32,
    pub sandbox_timeout_secs: u64,
    /// Interpreter command, split shell-style.
    pub interpreter: String,
    /// `None` disables the sandbox address-space limit.
    pub sandbox_memory_mb: Option<u64>,
    pub enable_retrieval: bool,
    /// JSON file of `[{title, content, tags}]` snippets.
    pub knowledge_path: Option<PathBuf>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_iterations: 15,
            sandbox_timeout_secs: 30,
            interpreter: "python3".into(),
            sandbox_memory_mb: Some(512),
            enable_retrieval: true,
            knowledge_path: None,
        }
    }
}

/// Top-level configuration (`.debugagent.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub llm: LlmConfig,
    pub scan: ScanConfig,
    pub debug: DebugConfig,
    pub budget: TokenBudget,
    pub loop_detection: LoopDetectorConfig,
}

impl AgentConfig {
    /// Load the first config file found in `dir`, else defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        for name in CONFIG_FILE_NAMES {
            let path = dir.join(name);
            if path.is_file() {
                debug!(path = %path.display(), "Loading config file");
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .context(format!("Failed to parse config TOML {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.debug.max_iterations == 0 {
            bail!("debug.max_iterations must be positive");
        }
        if self.debug.sandbox_timeout_secs == 0 {
            bail!("debug.sandbox_timeout_secs must be positive");
        }
        if self.debug.interpreter.trim().is_empty() {
            bail!("debug.interpreter must not be empty");
        }
        if self.llm.max_tokens == 0 {
            bail!("llm.max_tokens must be positive");
        }
        if self.scan.max_file_size == 0 {
            bail!("scan.max_file_size must be positive");
        }
        self.budget
            .validate()
            .map_err(|e| anyhow::anyhow!("budget: {e}"))?;
        if self.loop_detection.max_similar_code == 0 || self.loop_detection.max_same_error == 0 {
            bail!("loop_detection thresholds must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debug.max_retries, 3);
        assert_eq!(config.debug.max_iterations, 15);
        assert_eq!(config.budget.available(), 4000);
        assert_eq!(config.loop_detection.max_similar_code, 2);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
[debug]
max_retries = 5
interpreter = "python3 -X utf8"

[budget]
max_context_tokens = 8000

[scan]
ignore_dirs = ["vendor"]
"#,
        )
        .unwrap();
        assert_eq!(config.debug.max_retries, 5);
        assert_eq!(config.debug.max_iterations, 15);
        assert_eq!(config.budget.max_context_tokens, 8000);
        assert_eq!(config.budget.reserve_tokens, 2000);
        assert_eq!(config.scan.ignore_dirs, vec!["vendor".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_prefers_hidden_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("debugagent.toml"), "[debug]\nmax_retries = 1\n").unwrap();
        std::fs::write(dir.path().join(".debugagent.toml"), "[debug]\nmax_retries = 7\n").unwrap();
        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.debug.max_retries, 7);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.debug.max_iterations, 15);
    }

    #[test]
    fn test_invalid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".debugagent.toml"),
            "[budget]\nmax_context_tokens = 100\nreserve_tokens = 200\n",
        )
        .unwrap();
        let err = AgentConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("budget"));

        std::fs::write(dir.path().join(".debugagent.toml"), "not = [valid").unwrap();
        assert!(AgentConfig::load(dir.path()).is_err());
    }
}
