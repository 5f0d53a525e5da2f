use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("extract failed: {0}")]
    Extract(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("llm failed: {0}")]
    Llm(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One discovered page and its derived content.
///
/// `content` is absent when extraction failed for this URL; `score` is only
/// set after refinement; `debug` records extraction decisions for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debug: Vec<String>,
}

impl SearchResult {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: None,
            score: None,
            debug: Vec::new(),
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// The aggregate returned to callers: query string + results.
///
/// Results are in fan-out completion order at creation; the budgeting pass may
/// re-order them once by value density.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// Credentials for the OpenAI-compatible model provider used by refinement.
///
/// Absent credentials mean "refinement unavailable, proceed without it" —
/// never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProviderCredentials {
    pub base_url: String,
    pub api_key: String,
}

/// An isolated browser execution context owned by the session pool.
///
/// Callers borrow the context for the duration of one scoped operation; only
/// the pool closes it.
#[async_trait::async_trait]
pub trait ExecutionContext: Send + Sync + 'static {
    /// Close the context. Best-effort and idempotent; the pool logs failures
    /// and proceeds with eviction either way.
    async fn close(&self) -> Result<()>;
}

/// Opens execution contexts rooted at a per-session storage directory.
///
/// The browser engine is a collaborator; the pool only needs "create" and
/// "close", so tests can run against a stub factory.
#[async_trait::async_trait]
pub trait ContextFactory: Send + Sync + 'static {
    type Ctx: ExecutionContext;

    async fn create(&self, storage_dir: &Path) -> Result<Self::Ctx>;
}
