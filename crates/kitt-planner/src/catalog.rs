//! Model catalog: where the planner learns which quantisations exist.
//!
//! Discovery is behind a trait so planning stays a deterministic function of
//! (config, catalog): the HTTP implementation talks to the real providers,
//! tests use `StaticCatalog`.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Repo-relative file paths of a HuggingFace repository.
    async fn list_repo_files(&self, repo_id: &str) -> Result<Vec<String>>;

    /// Raw tag names (the part after `:`) published for an Ollama model.
    async fn list_ollama_tags(&self, model_name: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// HttpCatalog
// ---------------------------------------------------------------------------

/// Live catalog backed by the HuggingFace model API and the Ollama library
/// tags page.
pub struct HttpCatalog {
    client: reqwest::Client,
    hf_base: String,
    ollama_base: String,
}

#[derive(Debug, Deserialize)]
struct HfModelInfo {
    #[serde(default)]
    siblings: Vec<HfSibling>,
}

#[derive(Debug, Deserialize)]
struct HfSibling {
    rfilename: String,
}

impl HttpCatalog {
    pub fn new() -> Self {
        HttpCatalog {
            client: reqwest::Client::builder()
                .user_agent(concat!("kitt/", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            hf_base: "https://huggingface.co".to_string(),
            ollama_base: "https://ollama.com".to_string(),
        }
    }

    /// Point at alternate provider hosts (mirrors, test servers).
    pub fn with_bases(hf_base: impl Into<String>, ollama_base: impl Into<String>) -> Self {
        let mut c = Self::new();
        c.hf_base = hf_base.into();
        c.ollama_base = ollama_base.into();
        c
    }
}

impl Default for HttpCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelCatalog for HttpCatalog {
    async fn list_repo_files(&self, repo_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/models/{repo_id}", self.hf_base);
        let info: HfModelInfo = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("list repo files: {repo_id}"))?
            .error_for_status()
            .with_context(|| format!("list repo files: {repo_id}"))?
            .json()
            .await
            .with_context(|| format!("parse repo listing: {repo_id}"))?;

        let mut files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
        files.sort();
        Ok(files)
    }

    async fn list_ollama_tags(&self, model_name: &str) -> Result<Vec<String>> {
        let url = format!("{}/library/{model_name}/tags", self.ollama_base);
        let html = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("list ollama tags: {model_name}"))?
            .error_for_status()
            .with_context(|| format!("list ollama tags: {model_name}"))?
            .text()
            .await
            .with_context(|| format!("read ollama tags page: {model_name}"))?;

        Ok(parse_ollama_tags_page(model_name, &html))
    }
}

/// Pull tag names out of the library page's `/library/<model>:<tag>` hrefs,
/// deduplicating while preserving order.
fn parse_ollama_tags_page(model_name: &str, html: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"/library/([A-Za-z0-9._\-]+):([^"&\s]+)"#).expect("tag regex is valid")
    });

    let mut seen = std::collections::HashSet::new();
    let mut tags = Vec::new();
    for caps in re.captures_iter(html) {
        if &caps[1] != model_name {
            continue;
        }
        let tag = caps[2].to_string();
        if seen.insert(tag.clone()) {
            tags.push(tag);
        }
    }
    tags
}

// ---------------------------------------------------------------------------
// StaticCatalog (tests, dry runs)
// ---------------------------------------------------------------------------

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    repo_files: HashMap<String, Vec<String>>,
    ollama_tags: HashMap<String, Vec<String>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo_files(mut self, repo_id: &str, files: &[&str]) -> Self {
        self.repo_files.insert(
            repo_id.to_string(),
            files.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn with_ollama_tags(mut self, model_name: &str, tags: &[&str]) -> Self {
        self.ollama_tags.insert(
            model_name.to_string(),
            tags.iter().map(|s| s.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    async fn list_repo_files(&self, repo_id: &str) -> Result<Vec<String>> {
        Ok(self.repo_files.get(repo_id).cloned().unwrap_or_default())
    }

    async fn list_ollama_tags(&self, model_name: &str) -> Result<Vec<String>> {
        Ok(self.ollama_tags.get(model_name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tags_from_library_page() {
        let html = r#"
            <a href="/library/llama3.1:8b">8b</a>
            <a href="/library/llama3.1:8b-instruct-q4_0">q4</a>
            <a href="/library/llama3.1:8b">dup</a>
            <a href="/library/other:1b">other model</a>
        "#;
        let tags = parse_ollama_tags_page("llama3.1", html);
        assert_eq!(tags, vec!["8b".to_string(), "8b-instruct-q4_0".to_string()]);
    }
}
