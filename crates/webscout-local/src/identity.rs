//! Caller identity and model-provider credentials, derived from the
//! header-encoded environment hints the orchestration host forwards with each
//! request.

use sha2::{Digest, Sha256};
use webscout_core::{Error, ModelProviderCredentials, Result};

/// Request header carrying `KEY=VALUE` pairs, comma-separated. The header may
/// repeat; all values are scanned in order.
pub const ENV_HEADER: &str = "x-tool-env";

const WORKSPACE_ID_KEY: &str = "TOOL_WORKSPACE_ID";
const MODEL_BASE_URL_KEY: &str = "OPENAI_BASE_URL";
const MODEL_API_KEY_KEY: &str = "OPENAI_API_KEY";

/// Session identifiers are a fixed-length hex prefix of a one-way hash, so
/// they are stable per workspace but never reveal the workspace id itself.
const SESSION_ID_HEX_LEN: usize = 16;

/// Extract a single hint by key from the forwarded env header values.
/// Returns `None` when the key is absent.
pub fn env_hint(values: &[String], key: &str) -> Option<String> {
    for value in values {
        for pair in value.split(',') {
            let Some((k, v)) = pair.split_once('=') else {
                continue;
            };
            if k.trim() == key {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

fn non_blank_hint(values: &[String], key: &str) -> Option<String> {
    // Blank values behave the same as unset.
    env_hint(values, key).filter(|v| !v.is_empty())
}

pub fn workspace_id(values: &[String]) -> Option<String> {
    non_blank_hint(values, WORKSPACE_ID_KEY)
}

/// Derive the session identifier for a request. A session cannot be
/// anonymous: a missing workspace hint is a configuration error.
pub fn session_id(values: &[String]) -> Result<String> {
    let workspace_id = workspace_id(values).ok_or_else(|| {
        Error::Configuration("no workspace id provided".to_string())
    })?;
    let digest = Sha256::digest(workspace_id.as_bytes());
    Ok(hex::encode(digest)[..SESSION_ID_HEX_LEN].to_string())
}

/// Optional model-provider credentials for refinement. Absent (not an error)
/// unless both the base URL and the API key are present.
pub fn model_provider_credentials(values: &[String]) -> Option<ModelProviderCredentials> {
    let base_url = non_blank_hint(values, MODEL_BASE_URL_KEY)?;
    let api_key = non_blank_hint(values, MODEL_API_KEY_KEY)?;
    Some(ModelProviderCredentials { base_url, api_key })
}
