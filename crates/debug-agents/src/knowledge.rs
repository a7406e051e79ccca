//! Knowledge retrieval: ranked snippets of known error patterns and fixes.
//!
//! `KeywordKnowledgeBase` implements [`KnowledgeRetriever`] over a JSON file
//! of snippets. Tests and sessions without a knowledge source use
//! [`NoKnowledge`].

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AgentResult;

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub content: String,
    /// Similarity to the query, 0.0..=1.0
    pub similarity: f64,
    /// 1-based position in the result list
    pub rank: usize,
}

/// Abstraction over knowledge backends.
///
/// Results are ordered by descending similarity.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> AgentResult<Vec<KnowledgeHit>>;
}

/// Retriever that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKnowledge;

#[async_trait]
impl KnowledgeRetriever for NoKnowledge {
    async fn search(&self, _query: &str, _top_k: usize) -> AgentResult<Vec<KnowledgeHit>> {
        Ok(Vec::new())
    }
}

/// A stored snippet.
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeSnippet {
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Term-overlap ranking over an in-memory snippet list.
#[derive(Debug, Clone, Default)]
pub struct KeywordKnowledgeBase {
    snippets: Vec<(KnowledgeSnippet, HashSet<String>)>,
}

impl KeywordKnowledgeBase {
    pub fn new(snippets: Vec<KnowledgeSnippet>) -> Self {
        let snippets = snippets
            .into_iter()
            .map(|s| {
                let text = format!("{} {} {}", s.title, s.content, s.tags.join(" "));
                let terms = terms(&text);
                (s, terms)
            })
            .collect();
        Self { snippets }
    }

    /// Load `[{title, content, tags}]` from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        let snippets: Vec<KnowledgeSnippet> =
            serde_json::from_str(&content).context("Failed to parse knowledge base JSON")?;
        info!(path = %path.display(), snippets = snippets.len(), "Knowledge base loaded");
        Ok(Self::new(snippets))
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }
}

#[async_trait]
impl KnowledgeRetriever for KeywordKnowledgeBase {
    async fn search(&self, query: &str, top_k: usize) -> AgentResult<Vec<KnowledgeHit>> {
        let query_terms = terms(query);
        if query_terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f64, &KnowledgeSnippet)> = self
            .snippets
            .iter()
            .map(|(snippet, snippet_terms)| (jaccard(&query_terms, snippet_terms), snippet))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        // Stable: ties keep file order.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let hits: Vec<KnowledgeHit> = scored
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(i, (similarity, snippet))| KnowledgeHit {
                content: snippet.content.clone(),
                similarity,
                rank: i + 1,
            })
            .collect();
        debug!(query, hits = hits.len(), "Knowledge search");
        Ok(hits)
    }
}

/// Lowercase word set; single characters are noise.
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb() -> KeywordKnowledgeBase {
        KeywordKnowledgeBase::new(vec![
            KnowledgeSnippet {
                title: "NameError undefined function".into(),
                content: "A NameError for a function defined in another module means a missing import.".into(),
                tags: vec!["import".into()],
            },
            KnowledgeSnippet {
                title: "ZeroDivisionError".into(),
                content: "Guard the denominator before dividing.".into(),
                tags: vec![],
            },
            KnowledgeSnippet {
                title: "Circular import".into(),
                content: "Move the import inside the function to break the cycle.".into(),
                tags: vec!["import".into(), "ImportError".into()],
            },
        ])
    }

    #[tokio::test]
    async fn test_ranked_by_similarity() {
        let hits = kb()
            .search("NameError: name 'calculate' is not defined, missing import", 10)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].content.contains("missing import"));
        assert_eq!(hits[0].rank, 1);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert!(hits.iter().all(|h| !h.content.contains("denominator")));
    }

    #[tokio::test]
    async fn test_top_k_and_empty_query() {
        let base = kb();
        assert_eq!(base.search("import", 1).await.unwrap().len(), 1);
        assert!(base.search("   ", 5).await.unwrap().is_empty());
        assert!(NoKnowledge.search("anything", 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(&path, r#"[{"title": "t", "content": "c"}]"#).unwrap();
        let base = KeywordKnowledgeBase::from_file(&path).unwrap();
        assert_eq!(base.len(), 1);

        std::fs::write(&path, "{not json").unwrap();
        assert!(KeywordKnowledgeBase::from_file(&path).is_err());
    }
}
