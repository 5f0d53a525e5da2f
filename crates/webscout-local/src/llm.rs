//! OpenAI-compatible chat client used for per-result refinement.
//!
//! Built from credentials resolved per request, never from ambient process
//! env: the orchestration host decides which provider each caller may use.

use serde::{Deserialize, Serialize};
use webscout_core::{Error, ModelProviderCredentials, Result};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

fn model_from_env() -> String {
    crate::env("WEBSCOUT_REFINE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

fn timeout_ms_from_env() -> u64 {
    crate::env("WEBSCOUT_LLM_TIMEOUT_MS")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .clamp(1_000, 600_000)
}

#[derive(Debug, Clone)]
pub struct RefineClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_ms: u64,
}

impl RefineClient {
    pub fn new(client: reqwest::Client, creds: ModelProviderCredentials) -> Self {
        Self {
            client,
            base_url: creds.base_url,
            api_key: creds.api_key,
            model: model_from_env(),
            timeout_ms: timeout_ms_from_env(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_chat_completions(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Ask the model to refine one result's markdown for `topic`.
    ///
    /// Returns the raw model output; the first line carries the 0-10 grade,
    /// the rest is the excerpt document (see `refine::parse_refined_output`).
    pub async fn refine(&self, time: &str, topic: &str, url: &str, content: &str) -> Result<String> {
        let user = serde_json::json!({
            "time": time,
            "topic": topic,
            "url": url,
            "content": content,
        })
        .to_string();

        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: REFINE_INSTRUCTIONS.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: Some(0.0),
            stream: Some(false),
        };

        let resp = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("chat.completions HTTP {status}")));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        Ok(parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: String,
}

// The input schema is repeated in the instructions because the model only
// sees the serialized payload, not a tool schema.
const REFINE_INSTRUCTIONS: &str = r#"Do not respond with any additional dialog or commentary.

You are a research assistant tasked with extracting excerpts from a markdown document that will
be used as notes to conduct detailed research about a given topic.

The document is the result of exporting an HTML webpage to markdown.

When given an object with the following JSON schema:

{"type":"object","properties":{"time":{"type":"string","description":"Current date and time that the search was requested at"},"topic":{"type":"string","description":"Topic to extract excerpts for"},"url":{"type":"string","description":"URL that the markdown content was sourced from"},"content":{"type":"string","description":"Markdown document created by exporting an HTML web page to markdown"}},"required":["time","topic","url","content"]}

Perform the following steps in order:
1. Refine the markdown content by removing all:
  - boilerplate and unintelligible text
  - unrelated advertisements, links, and web page structure
2. Select excerpts from the refined content that you think would make good notes for conducting detailed research about the topic
3. Compose a concise markdown document containing the excerpts organized in descending order of importance to understanding the topic. Do not paraphrase, summarize, or reword the excerpts. The goal is to preserve as much of the original content as possible.
4. Grade the corpus of excerpts as a whole based how well it covers the topic on a scale of 0-10, where high scores are good and low scores contain no relevant information

Afterwards, respond with the grade followed by the markdown document on a new line.

EXAMPLE
5
<content of markdown document>
"#;
