//! Answer generation from assembled evidence.
//!
//! The prompt is a list of chat messages:
//!
//! 1. system: answer only from the provided context, say so if it has no answer
//! 2. system: attention note (only when conflicting sources were set aside)
//! 3. system: the document context
//! 4. the chat history, then the question as a `user` turn
//!
//! [`OpenAIChatGenerator`] sends it to any OpenAI-compatible
//! `/v1/chat/completions` endpoint (OpenAI, Ollama, vLLM, llama.cpp server).

use anyhow::bail;
use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::error::{EngineError, Result};
use crate::http;
use crate::models::{ChatMessage, RankedGroup};

const ORACLE: &str = "generation";

pub const SYSTEM_PROMPT: &str = "Using only the provided document context, give a short and precise \
answer to the user's question. If the context does not contain the answer, say so.";

/// Separator placed between evidence groups in the context.
pub const GROUP_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Earlier turns, oldest first. Excludes the question.
    pub history: &'a [ChatMessage],
    pub question: &'a str,
    pub context: &'a str,
    pub attention: Option<&'a str>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String>;
}

/// Join evidence into one context string: texts of a group on separate
/// lines, groups separated by `---`.
pub fn assemble_context(groups: &[RankedGroup]) -> String {
    groups
        .iter()
        .map(|g| g.texts.join("\n"))
        .collect::<Vec<_>>()
        .join(GROUP_SEPARATOR)
}

/// Lay out the prompt messages for `request`.
pub fn build_messages(system_prompt: &str, request: &GenerationRequest<'_>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new("system", system_prompt)];
    if let Some(note) = request.attention.filter(|n| !n.trim().is_empty()) {
        messages.push(ChatMessage::new("system", note));
    }
    messages.push(ChatMessage::new(
        "system",
        format!("Document context:\n{}", request.context),
    ));
    messages.extend(request.history.iter().cloned());
    messages.push(ChatMessage::new("user", request.question));
    messages
}

/// Generator for OpenAI-compatible chat completion APIs.
pub struct OpenAIChatGenerator {
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    system_prompt: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for openai provider"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        // Local servers usually need no key.
        let api_key = if config.url.is_some() {
            http::api_key(config.api_key_env.as_deref()).ok().flatten()
        } else {
            http::api_key(config.api_key_env.as_deref())?
        };

        Ok(Self {
            model,
            base_url,
            api_key,
            temperature: config.temperature,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| SYSTEM_PROMPT.to_string()),
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIChatGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let messages = build_messages(&self.system_prompt, request);
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let json = http::post_json(
            &self.client,
            "Chat",
            &format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')),
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await
        .map_err(|e| EngineError::oracle(ORACLE, e))?;

        parse_chat_response(&json).map_err(|e| EngineError::oracle(ORACLE, e))
    }
}

fn parse_chat_response(json: &serde_json::Value) -> anyhow::Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))
}

/// Create the generator named by `generation.provider`; `None` when disabled.
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Option<Box<dyn Generator>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Box::new(OpenAIChatGenerator::new(config)?))),
        other => bail!("Unknown generation provider: {}", other),
    }
}
