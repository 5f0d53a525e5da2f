use std::path::PathBuf;
use tracing::{error, info};

pub mod browser;
pub mod extract;
pub mod identity;
pub mod llm;
pub mod markdown;
pub mod refine;
pub mod search;
pub mod session;
pub mod tokens;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Root directory for per-session browser storage.
///
/// Defaults to the platform cache directory; `WEBSCOUT_CACHE_DIR` overrides it
/// (tests point this at a tempdir).
pub fn cache_root() -> PathBuf {
    if let Some(v) = env("WEBSCOUT_CACHE_DIR") {
        return PathBuf::from(v);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("webscout")
}

/// Remove the cache root wholesale. Called once at process startup so session
/// storage left behind by a previous run never bleeds into new sessions.
pub fn clear_cache_root() {
    let root = cache_root();
    match std::fs::remove_dir_all(&root) {
        Ok(()) => info!(path = %root.display(), "cleared cache root at startup"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %root.display(), error = %e, "failed to clear cache root"),
    }
}
